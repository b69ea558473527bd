//! Simulator errors

use sbl_security::SecurityError;
use sbl_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),
}

pub type Result<T> = std::result::Result<T, SimError>;
