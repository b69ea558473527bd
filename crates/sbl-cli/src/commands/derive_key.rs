//! Derive-key command - offline legacy key computation

use anyhow::{Context, Result};
use sbl_security::{derive_key as legacy_key, parse_key, FixedKey};
use serde_json::json;

use crate::output::OutputContext;

pub fn compute(seed: &str, fixed_key: &str) -> Result<[u8; 3]> {
    let seed = parse_key::<3>(seed).context("Invalid seed")?;
    let fixed_key = FixedKey::new(parse_key::<5>(fixed_key).context("Invalid fixed key")?);
    Ok(legacy_key(&seed, &fixed_key))
}

pub fn derive_key(seed: &str, fixed_key: &str, ctx: &OutputContext) -> Result<()> {
    let key = hex::encode_upper(compute(seed, fixed_key)?);
    ctx.json(&json!({ "seed": seed.to_uppercase(), "key": key }));
    if ctx.is_json() {
        return Ok(());
    }
    if ctx.quiet {
        println!("{}", key);
    } else {
        println!("Key: {}", key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_known_keys() {
        assert_eq!(compute("1A2B3C", "0102030405").unwrap(), [0x97, 0xFB, 0xDF]);
        assert_eq!(compute("abcdef", "0102030405").unwrap(), [0xAE, 0xAE, 0x49]);
    }

    #[test]
    fn test_bad_lengths() {
        assert!(compute("1A2B", "0102030405").is_err());
        assert!(compute("1A2B3C", "01020304").is_err());
    }
}
