//! Tester-side SecurityAccess engine
//!
//! Runs the legacy fixed-key or the AES authenticated handshake against the
//! ECU and keeps one [`SecuritySession`] per level. The ECU owns the
//! delay timer; the engine only mirrors what the NRCs report so callers
//! know how long to back off.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use sbl_security::{
    derive_key_from_slice, AuthKeys, ClientHandshake, FixedKey, SecurityAlgorithm, SecuritySession,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, UdsError};
use crate::uds::{DiagnosticSession, NegativeResponseCode, UdsService};

/// Algorithm variant chosen from the ECU's active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityVariant {
    /// Default or extended session: PIN algorithm "mode1_3"
    Application,
    /// Programming session
    Programming,
}

impl SecurityVariant {
    pub fn from_session(session: DiagnosticSession) -> Self {
        match session {
            DiagnosticSession::Default | DiagnosticSession::Extended => Self::Application,
            DiagnosticSession::Programming => Self::Programming,
        }
    }

    /// Decide the variant from a raw `62 F1 86 xx` response
    pub fn select(f186_response: &[u8]) -> Result<Self> {
        DiagnosticSession::from_f186_response(f186_response).map(Self::from_session)
    }
}

impl fmt::Display for SecurityVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "mode1_3"),
            Self::Programming => write!(f, "programming"),
        }
    }
}

pub struct SecurityAccessEngine {
    uds: UdsService,
    /// Delay the ECU applies after too many false attempts
    delay: Duration,
    sessions: HashMap<u8, SecuritySession>,
}

impl SecurityAccessEngine {
    pub fn new(uds: UdsService, delay: Duration) -> Self {
        Self {
            uds,
            delay,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, level: u8) -> Option<&SecuritySession> {
        self.sessions.get(&level)
    }

    pub fn is_unlocked(&self, level: u8) -> bool {
        self.session(level).is_some_and(|s| s.unlocked)
    }

    fn session_mut(&mut self, level: u8) -> Result<&mut SecuritySession> {
        if !self.sessions.contains_key(&level) {
            self.sessions.insert(level, SecuritySession::new(level)?);
        }
        self.sessions
            .get_mut(&level)
            .ok_or_else(|| UdsError::Config(format!("No security session for level 0x{:02X}", level)))
    }

    /// Forget seeds and unlocks after a session change or ECU reset.
    /// False-attempt counters and delay deadlines are kept.
    pub fn relock_all(&mut self) {
        for session in self.sessions.values_mut() {
            session.relock();
        }
    }

    /// requestSeed; `None` when the ECU answers with a zero seed because
    /// the level is already unlocked
    pub async fn request_seed(&mut self, level: u8) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let delay = self.delay;
        self.session_mut(level)?.expire_delay(now);

        let result = self.uds.security_access_request_seed(level).await;
        let session = self.session_mut(level)?;
        match result {
            Ok(seed) => {
                debug!(
                    level = format!("0x{:02X}", level),
                    seed = %hex::encode_upper(&seed),
                    "Seed received"
                );
                Ok(session.record_seed(seed.clone()).then_some(seed))
            }
            Err(e) => Err(refusal(session, e, now, delay)),
        }
    }

    /// sendKey for a seed obtained with [`Self::request_seed`]
    pub async fn send_key(&mut self, level: u8, key: &[u8]) -> Result<()> {
        let delay = self.delay;
        let session = self.session_mut(level)?;
        session.take_seed()?;
        session.record_key(key.to_vec());
        let key_level = session.key_level();

        let result = self.uds.security_access_send_key(key_level, key).await;
        let session = self.session_mut(level)?;
        match result {
            Ok(()) => {
                session.record_unlocked();
                info!(level = format!("0x{:02X}", level), "Security access granted");
                Ok(())
            }
            Err(e) => Err(refusal(session, e, Instant::now(), delay)),
        }
    }

    /// Full handshake for `level` with the configured algorithm
    pub async fn unlock(&mut self, level: u8, algorithm: &SecurityAlgorithm) -> Result<()> {
        info!(
            level = format!("0x{:02X}", level),
            algorithm = algorithm.name(),
            "Unlocking security level"
        );
        match algorithm {
            SecurityAlgorithm::Legacy { fixed_key } => self.unlock_legacy(level, fixed_key).await,
            SecurityAlgorithm::Aes(keys) => self.unlock_authenticated(level, keys).await,
        }
    }

    async fn unlock_legacy(&mut self, level: u8, fixed_key: &FixedKey) -> Result<()> {
        let Some(seed) = self.request_seed(level).await? else {
            return Ok(());
        };
        let key = derive_key_from_slice(&seed, fixed_key)?;
        self.send_key(level, &key).await
    }

    async fn unlock_authenticated(&mut self, level: u8, keys: &AuthKeys) -> Result<()> {
        let delay = self.delay;
        let mut handshake = ClientHandshake::new(keys.clone(), level)?;

        let now = Instant::now();
        self.session_mut(level)?.expire_delay(now);
        let result = self.uds.request(&handshake.request_seed()).await;
        let session = self.session_mut(level)?;
        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(refusal(session, e, now, delay)),
        };
        session.record_seed(response.clone());

        let send_key = match handshake.send_key(&response) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    level = format!("0x{:02X}", level),
                    response = %hex::encode_upper(&response),
                    error = %e,
                    "Rejecting seed response"
                );
                session.relock();
                return Err(e.into());
            }
        };
        session.take_seed()?;
        session.record_key(send_key.clone());
        let key_level = session.key_level();

        let result = self.uds.request(&send_key).await;
        let session = self.session_mut(level)?;
        match result {
            Ok(response) if response.get(1) == Some(&key_level) => {
                session.record_unlocked();
                info!(level = format!("0x{:02X}", level), "Security access granted");
                Ok(())
            }
            Ok(response) => Err(UdsError::InvalidResponse(format!(
                "Key response for wrong level: {}",
                hex::encode_upper(&response)
            ))),
            Err(e) => Err(refusal(session, e, Instant::now(), delay)),
        }
    }
}

/// Record what a negative SecurityAccess response says about the ECU's
/// counters and turn it into [`UdsError::SecurityAccessDenied`]
fn refusal(session: &mut SecuritySession, error: UdsError, now: Instant, delay: Duration) -> UdsError {
    let nrc = match error {
        UdsError::NegativeResponse { nrc, .. } if nrc.is_security_refusal() => nrc,
        other => return other,
    };

    match nrc {
        NegativeResponseCode::InvalidKey => session.record_invalid_key(),
        NegativeResponseCode::ExceededNumberOfAttempts => {
            session.record_invalid_key();
            session.record_delay(now, delay);
        }
        _ => {
            if !session.delay_timer_active(now) {
                session.record_delay(now, delay);
            }
        }
    }
    session.relock();

    let retry_after = session.delay_remaining(now);
    warn!(
        level = format!("0x{:02X}", session.level),
        %nrc,
        false_attempts = session.false_attempt_count,
        retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
        "Security access refused"
    );
    UdsError::SecurityAccessDenied {
        level: session.level,
        nrc,
        retry_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sbl_security::SecurityError;
    use sbl_transport::MockTransportAdapter;
    use std::sync::Arc;

    const FIXED_KEY: FixedKey = FixedKey::new([0x01, 0x02, 0x03, 0x04, 0x05]);

    fn engine() -> (Arc<MockTransportAdapter>, SecurityAccessEngine) {
        let mock = Arc::new(MockTransportAdapter::new());
        mock.add_response(vec![0x27, 0x01], vec![0x67, 0x01, 0x1A, 0x2B, 0x3C]);
        let engine = SecurityAccessEngine::new(UdsService::new(mock.clone()), Duration::from_secs(10));
        (mock, engine)
    }

    fn legacy() -> SecurityAlgorithm {
        SecurityAlgorithm::Legacy { fixed_key: FIXED_KEY }
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(
            SecurityVariant::select(&[0x62, 0xF1, 0x86, 0x01]).unwrap(),
            SecurityVariant::Application
        );
        assert_eq!(
            SecurityVariant::select(&[0x62, 0xF1, 0x86, 0x03]).unwrap(),
            SecurityVariant::Application
        );
        assert_eq!(
            SecurityVariant::select(&[0x62, 0xF1, 0x86, 0x02]).unwrap(),
            SecurityVariant::Programming
        );
        assert!(SecurityVariant::select(&[0x62, 0xF1, 0x86, 0x09]).is_err());
        assert_eq!(SecurityVariant::Application.to_string(), "mode1_3");
    }

    #[tokio::test]
    async fn test_legacy_unlock() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x02, 0x97, 0xFB, 0xDF], vec![0x67, 0x02]);

        engine.unlock(0x01, &legacy()).await.unwrap();

        assert!(engine.is_unlocked(0x01));
        let session = engine.session(0x01).unwrap();
        assert_eq!(session.derived_key, Some(vec![0x97, 0xFB, 0xDF]));
        assert_eq!(
            mock.requests_for(0x27),
            vec![vec![0x27, 0x01], vec![0x27, 0x02, 0x97, 0xFB, 0xDF]]
        );
    }

    #[tokio::test]
    async fn test_zero_seed_skips_key() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x01], vec![0x67, 0x01, 0x00, 0x00, 0x00]);

        engine.unlock(0x01, &legacy()).await.unwrap();
        assert!(engine.is_unlocked(0x01));
        assert_eq!(mock.requests_for(0x27).len(), 1);
    }

    #[tokio::test]
    async fn test_key_without_seed_is_not_sent() {
        let (mock, mut engine) = engine();
        assert!(matches!(
            engine.send_key(0x01, &[1, 2, 3]).await,
            Err(UdsError::Security(SecurityError::SeedNotRequested(0x01)))
        ));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_seed_used_once() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x02], vec![0x7F, 0x27, 0x35]);

        engine.request_seed(0x01).await.unwrap();
        assert!(engine.send_key(0x01, &[0, 0, 0]).await.is_err());
        assert!(matches!(
            engine.send_key(0x01, &[0, 0, 0]).await,
            Err(UdsError::Security(SecurityError::SeedNotRequested(0x01)))
        ));
        assert_eq!(mock.requests_for(0x27).len(), 2);
    }

    #[tokio::test]
    async fn test_refusals_update_counters() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x02], vec![0x7F, 0x27, 0x35]);

        engine.request_seed(0x01).await.unwrap();
        match engine.send_key(0x01, &[0, 0, 0]).await {
            Err(UdsError::SecurityAccessDenied {
                level: 0x01,
                nrc: NegativeResponseCode::InvalidKey,
                retry_after: None,
            }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.session(0x01).unwrap().false_attempt_count, 1);

        mock.add_response(vec![0x27, 0x02], vec![0x7F, 0x27, 0x36]);
        engine.request_seed(0x01).await.unwrap();
        match engine.send_key(0x01, &[0, 0, 0]).await {
            Err(UdsError::SecurityAccessDenied {
                nrc: NegativeResponseCode::ExceededNumberOfAttempts,
                retry_after: Some(delay),
                ..
            }) => assert!(delay <= Duration::from_secs(10)),
            other => panic!("unexpected {:?}", other),
        }
        let session = engine.session(0x01).unwrap();
        assert_eq!(session.false_attempt_count, 2);
        assert!(session.delay_timer_deadline.is_some());
        assert!(!session.unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_nrc_on_seed() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x01], vec![0x7F, 0x27, 0x37]);

        match engine.request_seed(0x01).await {
            Err(UdsError::SecurityAccessDenied {
                nrc: NegativeResponseCode::RequiredTimeDelayNotExpired,
                retry_after: Some(delay),
                ..
            }) => assert_eq!(delay, Duration::from_secs(10)),
            other => panic!("unexpected {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        mock.add_response(vec![0x27, 0x01], vec![0x67, 0x01, 0x1A, 0x2B, 0x3C]);
        assert!(engine.request_seed(0x01).await.unwrap().is_some());
        assert!(engine.session(0x01).unwrap().delay_timer_deadline.is_none());
    }

    #[tokio::test]
    async fn test_other_nrcs_pass_through() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x01], vec![0x7F, 0x27, 0x22]);
        assert!(matches!(
            engine.request_seed(0x01).await,
            Err(UdsError::NegativeResponse {
                nrc: NegativeResponseCode::ConditionsNotCorrect,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_relock_keeps_counters() {
        let (mock, mut engine) = engine();
        mock.add_response(vec![0x27, 0x02], vec![0x7F, 0x27, 0x35]);
        engine.request_seed(0x01).await.unwrap();
        let _ = engine.send_key(0x01, &[0, 0, 0]).await;

        engine.relock_all();
        assert_eq!(engine.session(0x01).unwrap().false_attempt_count, 1);
        assert!(!engine.is_unlocked(0x01));
    }

    #[tokio::test]
    async fn test_even_level_rejected() {
        let (_mock, mut engine) = engine();
        assert!(matches!(
            engine.request_seed(0x02).await,
            Err(UdsError::Security(SecurityError::InvalidLevel(0x02)))
        ));
    }

    #[tokio::test]
    async fn test_reserved_level_rejected_before_sending() {
        let (mock, mut engine) = engine();
        let algorithm = SecurityAlgorithm::Legacy { fixed_key: FIXED_KEY };
        assert!(matches!(
            engine.unlock(0xFF, &algorithm).await,
            Err(UdsError::Security(SecurityError::InvalidLevel(0xFF)))
        ));
        assert!(mock.requests_for(0x27).is_empty());
    }
}
