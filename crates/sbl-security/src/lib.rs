//! SecurityAccess (0x27) algorithms and attempt tracking
//!
//! - [`legacy`]: the fixed-key 3-byte seed/key algorithm
//! - [`authenticated`]: the AES-CMAC/CTR authenticated method
//! - [`attempts`]: ECU-side delay timer and seed rate limit
//! - [`session`]: tester-side per-level state

pub mod algorithm;
pub mod attempts;
pub mod authenticated;
pub mod error;
mod hex_array;
pub mod legacy;
pub mod session;

pub use algorithm::SecurityAlgorithm;
pub use attempts::{DelayTimerConfig, DelayTimerState, Rejection, SecurityGuard};
pub use authenticated::{
    client_proof, server_proof, AuthKeys, ClientHandshake, ClientRequestSeed, ClientSendKey,
    ServerHandshake, ServerResponseSeed,
};
pub use error::{Result, SecurityError};
pub use legacy::{derive_key, derive_key_from_slice, FixedKey};
pub use session::{check_seed_level, SecuritySession, MAX_SEED_LEVEL};

/// Parse a hex string into a fixed-size key
pub fn parse_key<const N: usize>(text: &str) -> Result<[u8; N]> {
    hex_array::parse::<N>(text).map_err(SecurityError::InvalidKeyMaterial)
}
