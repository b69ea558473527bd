//! Seed/key algorithm families

use serde::{Deserialize, Serialize};

use crate::authenticated::AuthKeys;
use crate::legacy::FixedKey;

/// Which handshake a security level speaks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SecurityAlgorithm {
    /// 3-byte seed, 3-byte key from the fixed-key LFSR
    Legacy { fixed_key: FixedKey },
    /// AES-CMAC/CTR authenticated method 0x0001
    Aes(AuthKeys),
}

impl SecurityAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Legacy { .. } => "legacy",
            Self::Aes(_) => "aes",
        }
    }
}
