//! ECU-side false-attempt counting, delay timer and seed rate limit
//!
//! Each security level keeps its own state:
//!
//! ```text
//! Clear --invalid key--> Counting(n) --n reaches threshold--> Delayed
//!   ^                        |                                   |
//!   +------valid key---------+<------- delay expires ------------+
//! ```
//!
//! Expiry keeps the counter, so one more invalid key re-enters `Delayed`.
//! Transitions only happen on requestSeed/sendKey events.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

fn default_false_attempt_threshold() -> u8 {
    2
}

fn default_delay_ms() -> u64 {
    10_000
}

fn default_boot_delay_ms() -> u64 {
    5_000
}

fn default_seed_window_ms() -> u64 {
    5_000
}

fn default_seeds_per_window() -> u8 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayTimerConfig {
    /// Invalid keys that arm the delay timer
    #[serde(default = "default_false_attempt_threshold")]
    pub false_attempt_threshold: u8,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Seeds are refused for this long after power-up or reset
    #[serde(default = "default_boot_delay_ms")]
    pub boot_delay_ms: u64,
    #[serde(default = "default_seed_window_ms")]
    pub seed_window_ms: u64,
    /// Accepted seed requests per window; 0 disables the limit
    #[serde(default = "default_seeds_per_window")]
    pub seeds_per_window: u8,
}

impl Default for DelayTimerConfig {
    fn default() -> Self {
        Self {
            false_attempt_threshold: default_false_attempt_threshold(),
            delay_ms: default_delay_ms(),
            boot_delay_ms: default_boot_delay_ms(),
            seed_window_ms: default_seed_window_ms(),
            seeds_per_window: default_seeds_per_window(),
        }
    }
}

impl DelayTimerConfig {
    /// No boot delay and no rate limit; useful for simulation
    pub fn relaxed() -> Self {
        Self {
            boot_delay_ms: 0,
            seeds_per_window: 0,
            ..Self::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    pub fn seed_window(&self) -> Duration {
        Duration::from_millis(self.seed_window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayTimerState {
    /// No false attempts recorded
    Clear,
    Counting { false_attempts: u8 },
    Delayed { false_attempts: u8, until: Instant },
}

/// Why the guard refused a request, mapped onto its NRC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("required time delay not expired")]
    DelayNotExpired,
    #[error("seed requested too often")]
    RateLimited,
    #[error("invalid key")]
    InvalidKey,
    #[error("exceeded number of attempts")]
    ExceededAttempts,
    #[error("key sent without a preceding seed")]
    SeedNotRequested,
}

impl Rejection {
    pub fn nrc(self) -> u8 {
        match self {
            Self::DelayNotExpired => 0x37,
            Self::RateLimited => 0x22,
            Self::InvalidKey => 0x35,
            Self::ExceededAttempts => 0x36,
            Self::SeedNotRequested => 0x24,
        }
    }
}

#[derive(Debug, Default)]
struct LevelState {
    false_attempts: u8,
    delay_until: Option<Instant>,
    seed_requests: VecDeque<Instant>,
    seed_pending: bool,
}

#[derive(Debug)]
pub struct SecurityGuard {
    config: DelayTimerConfig,
    boot_until: Instant,
    levels: HashMap<u8, LevelState>,
    unlocked: Option<u8>,
}

impl SecurityGuard {
    pub fn new(config: DelayTimerConfig, now: Instant) -> Self {
        let boot_until = now + config.boot_delay();
        Self {
            config,
            boot_until,
            levels: HashMap::new(),
            unlocked: None,
        }
    }

    pub fn config(&self) -> &DelayTimerConfig {
        &self.config
    }

    /// ECU reset: relock, restart the boot delay and drop pending seeds.
    /// False-attempt counters survive.
    pub fn reboot(&mut self, now: Instant) {
        self.boot_until = now + self.config.boot_delay();
        self.unlocked = None;
        for state in self.levels.values_mut() {
            state.seed_pending = false;
        }
    }

    /// Session change: relock without touching counters
    pub fn lock(&mut self) {
        self.unlocked = None;
        for state in self.levels.values_mut() {
            state.seed_pending = false;
        }
    }

    pub fn unlocked_level(&self) -> Option<u8> {
        self.unlocked
    }

    pub fn is_unlocked(&self, level: u8) -> bool {
        self.unlocked == Some(level)
    }

    pub fn state(&self, level: u8) -> DelayTimerState {
        match self.levels.get(&level) {
            None => DelayTimerState::Clear,
            Some(state) => match (state.false_attempts, state.delay_until) {
                (false_attempts, Some(until)) => DelayTimerState::Delayed { false_attempts, until },
                (0, None) => DelayTimerState::Clear,
                (false_attempts, None) => DelayTimerState::Counting { false_attempts },
            },
        }
    }

    /// Admit a requestSeed for `level`
    pub fn on_request_seed(&mut self, level: u8, now: Instant) -> Result<(), Rejection> {
        if now < self.boot_until {
            debug!(level = format!("0x{:02X}", level), "Seed refused during boot delay");
            return Err(Rejection::DelayNotExpired);
        }

        let window = self.config.seed_window();
        let limit = self.config.seeds_per_window as usize;
        let state = self.levels.entry(level).or_default();

        if let Some(until) = state.delay_until {
            if now < until {
                debug!(
                    level = format!("0x{:02X}", level),
                    remaining_ms = (until - now).as_millis() as u64,
                    "Seed refused, delay timer active"
                );
                return Err(Rejection::DelayNotExpired);
            }
            info!(
                level = format!("0x{:02X}", level),
                false_attempts = state.false_attempts,
                "Delay timer expired"
            );
            state.delay_until = None;
        }

        while let Some(first) = state.seed_requests.front() {
            if now.duration_since(*first) >= window {
                state.seed_requests.pop_front();
            } else {
                break;
            }
        }
        if limit > 0 && state.seed_requests.len() >= limit {
            warn!(
                level = format!("0x{:02X}", level),
                requests = state.seed_requests.len(),
                "Seed request rate exceeded"
            );
            return Err(Rejection::RateLimited);
        }

        state.seed_requests.push_back(now);
        state.seed_pending = true;
        Ok(())
    }

    /// Judge a sendKey for `level`. `verify` runs only when a seed is
    /// pending and no delay is active.
    pub fn on_send_key(
        &mut self,
        level: u8,
        now: Instant,
        verify: impl FnOnce() -> bool,
    ) -> Result<(), Rejection> {
        let threshold = self.config.false_attempt_threshold;
        let delay = self.config.delay();
        let state = self.levels.entry(level).or_default();

        if !std::mem::take(&mut state.seed_pending) {
            return Err(Rejection::SeedNotRequested);
        }
        if state.delay_until.is_some_and(|until| now < until) {
            return Err(Rejection::DelayNotExpired);
        }

        if verify() {
            state.false_attempts = 0;
            state.delay_until = None;
            state.seed_requests.clear();
            self.unlocked = Some(level);
            info!(level = format!("0x{:02X}", level), "Security level unlocked");
            return Ok(());
        }

        state.false_attempts = state.false_attempts.saturating_add(1);
        if state.false_attempts >= threshold {
            state.delay_until = Some(now + delay);
            warn!(
                level = format!("0x{:02X}", level),
                false_attempts = state.false_attempts,
                delay_ms = delay.as_millis() as u64,
                "Invalid key, delay timer armed"
            );
            Err(Rejection::ExceededAttempts)
        } else {
            warn!(
                level = format!("0x{:02X}", level),
                false_attempts = state.false_attempts,
                "Invalid key"
            );
            Err(Rejection::InvalidKey)
        }
    }
}
