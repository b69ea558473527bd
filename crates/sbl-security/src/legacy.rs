//! Legacy fixed-key SecurityAccess algorithm
//!
//! A 24-bit LFSR is seeded with `0xC541A9` and clocked over the 64-bit
//! challenge formed from the reversed fixed key followed by the reversed
//! seed. Each clock shifts right; when the challenge bit differs from the
//! register's low bit, bit 23 is set and the feedback taps `0x109028` are
//! applied. The final register is permuted into three key bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

pub const SEED_LEN: usize = 3;
pub const KEY_LEN: usize = 3;
pub const FIXED_KEY_LEN: usize = 5;

const INITIAL_REGISTER: u32 = 0x00C5_41A9;
const FEEDBACK_TAPS: u32 = 0x0010_9028;
const HIGH_BIT: u32 = 0x0080_0000;

/// The ECU-specific 5-byte secret
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixedKey(#[serde(with = "crate::hex_array")] [u8; FIXED_KEY_LEN]);

impl FixedKey {
    pub const fn new(bytes: [u8; FIXED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FIXED_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for FixedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FixedKey(**********)")
    }
}

impl FromStr for FixedKey {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::hex_array::parse::<FIXED_KEY_LEN>(s)
            .map(Self)
            .map_err(SecurityError::InvalidKeyMaterial)
    }
}

/// Derive the 3-byte key for a 3-byte seed
pub fn derive_key(seed: &[u8; SEED_LEN], fixed_key: &FixedKey) -> [u8; KEY_LEN] {
    let fk = fixed_key.as_bytes();
    let challenge = u64::from_be_bytes([fk[4], fk[3], fk[2], fk[1], fk[0], seed[2], seed[1], seed[0]]);

    let mut register = INITIAL_REGISTER;
    for i in 0..64 {
        let bit = ((challenge >> i) & 1) as u32 ^ (register & 1);
        register >>= 1;
        if bit == 1 {
            register = (register | HIGH_BIT) ^ FEEDBACK_TAPS;
        }
    }

    [
        ((register >> 4) & 0xFF) as u8,
        (((register >> 20) & 0x0F) | ((register >> 8) & 0xF0)) as u8,
        (((register << 4) & 0xF0) | ((register >> 16) & 0x0F)) as u8,
    ]
}

/// Slice-based variant for seeds taken straight from a response
pub fn derive_key_from_slice(seed: &[u8], fixed_key: &FixedKey) -> Result<[u8; KEY_LEN], SecurityError> {
    let seed: &[u8; SEED_LEN] = seed.try_into().map_err(|_| SecurityError::InvalidLength {
        message: "legacy seed",
        expected: SEED_LEN,
        actual: seed.len(),
    })?;
    Ok(derive_key(seed, fixed_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KEY: FixedKey = FixedKey::new([0x01, 0x02, 0x03, 0x04, 0x05]);

    #[test]
    fn test_known_vectors() {
        let vectors: [([u8; 3], [u8; 3]); 5] = [
            ([0xAB, 0xCD, 0xEF], [0xAE, 0xAE, 0x49]),
            ([0x1A, 0x2B, 0x3C], [0x97, 0xFB, 0xDF]),
            ([0x00, 0x00, 0x00], [0xE1, 0xAE, 0x1E]),
            ([0xFF, 0xFF, 0xFF], [0x8A, 0x53, 0xC7]),
            ([0x8C, 0xE7, 0xD1], [0x0A, 0x51, 0x64]),
        ];
        for (seed, key) in vectors {
            assert_eq!(derive_key(&seed, &KEY), key, "seed {}", hex::encode_upper(seed));
        }
    }

    #[test]
    fn test_fixed_key_changes_result() {
        let other = FixedKey::new([0xFF; 5]);
        assert_eq!(derive_key(&[0xAB, 0xCD, 0xEF], &other), [0x49, 0xFA, 0xC7]);
    }

    #[test]
    fn test_slice_length_checked() {
        assert_eq!(
            derive_key_from_slice(&[0xAB, 0xCD, 0xEF], &KEY).unwrap(),
            [0xAE, 0xAE, 0x49]
        );
        assert!(matches!(
            derive_key_from_slice(&[0xAB, 0xCD], &KEY),
            Err(SecurityError::InvalidLength { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_fixed_key_parsing() {
        assert_eq!("0102030405".parse::<FixedKey>().unwrap(), KEY);
        assert_eq!("0x0102030405".parse::<FixedKey>().unwrap(), KEY);
        assert!("01020304".parse::<FixedKey>().is_err());
        assert!("zz02030405".parse::<FixedKey>().is_err());
        assert_eq!(format!("{:?}", KEY), "FixedKey(**********)");
    }

    #[test]
    fn test_fixed_key_serde() {
        let json = serde_json::to_string(&KEY).unwrap();
        assert_eq!(json, "\"0102030405\"");
        let back: FixedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, KEY);
    }
}
