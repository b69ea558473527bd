//! SecurityAccess errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("{message}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        message: &'static str,
        expected: usize,
        actual: usize,
    },

    /// CMAC over the message did not verify
    #[error("Authentication failed for {0}")]
    AuthenticationFailed(&'static str),

    #[error("Unexpected message id 0x{actual:04X}, expected 0x{expected:04X}")]
    UnexpectedMessageId { expected: u16, actual: u16 },

    #[error("Unsupported authentication method 0x{0:04X}")]
    UnsupportedAuthMethod(u16),

    #[error("Unexpected service id 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedServiceId { expected: u8, actual: u8 },

    #[error("Proof of ownership mismatch")]
    ProofMismatch,

    #[error("Key requested without a preceding seed for level 0x{0:02X}")]
    SeedNotRequested(u8),

    #[error("Invalid security level 0x{0:02X}: requestSeed sub-functions are odd")]
    InvalidLevel(u8),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

pub type Result<T> = std::result::Result<T, SecurityError>;
