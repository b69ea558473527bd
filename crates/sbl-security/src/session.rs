//! Tester-side view of one security level

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, SecurityError};

/// Highest requestSeed sub-function; 0x7F and up are reserved
pub const MAX_SEED_LEVEL: u8 = 0x7D;

/// requestSeed levels are odd and within 0x01..=0x7D, so the sendKey
/// sub-function is always `level + 1`
pub fn check_seed_level(level: u8) -> Result<()> {
    if level % 2 == 0 || level > MAX_SEED_LEVEL {
        return Err(SecurityError::InvalidLevel(level));
    }
    Ok(())
}

/// Per-level client state. Counters mirror what the ECU reported and are
/// kept across diagnostic session changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuritySession {
    /// requestSeed sub-function (odd)
    pub level: u8,
    /// Seed of the pending handshake; taken when the key is sent
    pub seed: Option<Vec<u8>>,
    pub derived_key: Option<Vec<u8>>,
    pub false_attempt_count: u8,
    pub delay_timer_deadline: Option<Instant>,
    pub unlocked: bool,
}

impl SecuritySession {
    pub fn new(level: u8) -> Result<Self> {
        check_seed_level(level)?;
        Ok(Self {
            level,
            seed: None,
            derived_key: None,
            false_attempt_count: 0,
            delay_timer_deadline: None,
            unlocked: false,
        })
    }

    /// sendKey sub-function
    pub fn key_level(&self) -> u8 {
        self.level + 1
    }

    pub fn delay_timer_active(&self, now: Instant) -> bool {
        self.delay_remaining(now).is_some()
    }

    pub fn delay_remaining(&self, now: Instant) -> Option<Duration> {
        self.delay_timer_deadline
            .filter(|deadline| now < *deadline)
            .map(|deadline| deadline - now)
    }

    /// Store the seed of a positive requestSeed response. An all-zero seed
    /// means the level is already unlocked; returns whether a key is needed.
    pub fn record_seed(&mut self, seed: Vec<u8>) -> bool {
        if seed.iter().all(|b| *b == 0) {
            debug!(level = format!("0x{:02X}", self.level), "Zero seed, level already unlocked");
            self.seed = None;
            self.unlocked = true;
            return false;
        }
        self.seed = Some(seed);
        self.derived_key = None;
        self.unlocked = false;
        true
    }

    pub fn take_seed(&mut self) -> Result<Vec<u8>> {
        self.seed.take().ok_or(SecurityError::SeedNotRequested(self.level))
    }

    pub fn record_key(&mut self, key: Vec<u8>) {
        self.derived_key = Some(key);
    }

    pub fn record_unlocked(&mut self) {
        self.false_attempt_count = 0;
        self.delay_timer_deadline = None;
        self.unlocked = true;
    }

    pub fn record_invalid_key(&mut self) {
        self.false_attempt_count = self.false_attempt_count.saturating_add(1);
        self.unlocked = false;
    }

    /// The ECU reported an active delay timer
    pub fn record_delay(&mut self, now: Instant, delay: Duration) {
        self.delay_timer_deadline = Some(now + delay);
        self.unlocked = false;
    }

    /// Drop an elapsed deadline; the false-attempt count is kept
    pub fn expire_delay(&mut self, now: Instant) -> bool {
        match self.delay_timer_deadline {
            Some(deadline) if now >= deadline => {
                self.delay_timer_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Session change or ECU reset
    pub fn relock(&mut self) {
        self.seed = None;
        self.unlocked = false;
    }
}
