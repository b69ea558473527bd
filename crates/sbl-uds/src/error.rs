//! UDS and flashing errors

use std::time::Duration;

use sbl_security::SecurityError;
use sbl_transport::TransportError;
use sbl_vbf::VbfError;
use thiserror::Error;

use crate::uds::{NegativeResponseCode, RoutineStatus};

#[derive(Debug, Error)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// TransferData counter echo or transfer-exit checksum out of step
    #[error("Protocol sequence error: {0}")]
    ProtocolSequence(String),

    #[error("Security access denied for level 0x{level:02X}: {nrc}")]
    SecurityAccessDenied {
        level: u8,
        nrc: NegativeResponseCode,
        /// Time the ECU is expected to keep refusing seeds
        retry_after: Option<Duration>,
    },

    #[error("Routine 0x{routine_id:04X} failed: {status}")]
    RoutineFailed {
        routine_id: u16,
        status: RoutineStatus,
    },

    #[error("Response timeout")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("VBF error: {0}")]
    Vbf(#[from] VbfError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl UdsError {
    /// NRC carried by the error, if the ECU answered negatively
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } | Self::SecurityAccessDenied { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, UdsError>;
