//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Payload too large: {0} bytes (maximum 4095)")]
    PayloadTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid flow control: {0}")]
    InvalidFlowControl(String),

    /// Out-of-order consecutive frame, unexpected frame type or unsolicited flow control
    #[error("Protocol sequence error: {reason} (frame: {frame})")]
    ProtocolSequence { reason: String, frame: String },

    #[error("Receiver reported overflow, transfer aborted")]
    Overflow,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    pub(crate) fn sequence(reason: impl Into<String>, frame: &[u8]) -> Self {
        Self::ProtocolSequence {
            reason: reason.into(),
            frame: hex::encode_upper(frame),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
