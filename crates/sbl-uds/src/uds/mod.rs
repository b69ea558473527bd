//! UDS (ISO 14229) protocol layer used while programming

mod nrc;
mod routine;
mod services;

pub use nrc::NegativeResponseCode;
pub use routine::{RoutineResult, RoutineStatus};
pub use services::UdsService;

use crate::error::{Result, UdsError};

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Positive responses echo the request SID plus this offset
    pub const POSITIVE_OFFSET: u8 = 0x40;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Routine identifiers of the programming sequence
pub mod routine_id {
    /// Erase one memory range
    pub const ERASE_MEMORY: u16 = 0xFF00;
    /// Jump to the downloaded secondary bootloader
    pub const ACTIVATE_SBL: u16 = 0x0301;
    /// Verify the last downloaded file
    pub const CHECK_MEMORY: u16 = 0x0212;
    /// Check programming dependencies after the last file
    pub const COMPLETE_AND_COMPATIBLE: u16 = 0x0205;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    pub const SOFT_RESET: u8 = 0x03;
}

pub mod standard_did {
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
}

/// `addressAndLengthFormatIdentifier` for 4-byte address and 4-byte size
pub const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;

/// Diagnostic sessions (0x10 sub-functions and DID F186 values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticSession {
    Default,
    Programming,
    Extended,
}

impl DiagnosticSession {
    pub fn id(self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Default),
            0x02 => Some(Self::Programming),
            0x03 => Some(Self::Extended),
            _ => None,
        }
    }

    /// Decode a positive ReadDataByIdentifier response for DID F186,
    /// i.e. `62 F1 86 <session>`
    pub fn from_f186_response(response: &[u8]) -> Result<Self> {
        let did = standard_did::ACTIVE_DIAGNOSTIC_SESSION.to_be_bytes();
        match response {
            [0x62, hi, lo, session] if [*hi, *lo] == did => Self::from_id(*session).ok_or_else(|| {
                UdsError::InvalidResponse(format!("Unknown active session 0x{:02X}", session))
            }),
            _ => Err(UdsError::InvalidResponse(format!(
                "Not an active-session response: {}",
                hex::encode_upper(response)
            ))),
        }
    }
}

impl std::fmt::Display for DiagnosticSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Programming => write!(f, "programming"),
            Self::Extended => write!(f, "extended"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f186_decoding() {
        assert_eq!(
            DiagnosticSession::from_f186_response(&[0x62, 0xF1, 0x86, 0x01]).unwrap(),
            DiagnosticSession::Default
        );
        assert_eq!(
            DiagnosticSession::from_f186_response(&[0x62, 0xF1, 0x86, 0x02]).unwrap(),
            DiagnosticSession::Programming
        );
        assert_eq!(
            DiagnosticSession::from_f186_response(&[0x62, 0xF1, 0x86, 0x03]).unwrap(),
            DiagnosticSession::Extended
        );
    }

    #[test]
    fn test_f186_rejects_other_responses() {
        assert!(DiagnosticSession::from_f186_response(&[0x62, 0xF1, 0x86, 0x04]).is_err());
        assert!(DiagnosticSession::from_f186_response(&[0x62, 0xF1, 0x87, 0x01]).is_err());
        assert!(DiagnosticSession::from_f186_response(&[0x62, 0xF1, 0x86]).is_err());
        assert!(DiagnosticSession::from_f186_response(&[0x7F, 0x22, 0x31]).is_err());
    }
}
