//! AES-128 authenticated SecurityAccess method (authentication method 0x0001)
//!
//! Every message ends with an AES-CMAC over all preceding bytes, keyed with
//! the authentication key. Nonces and proofs travel AES-CTR encrypted under
//! the same key, the IV serving as the big-endian initial counter block.
//!
//! ```text
//! clientRequestSeed  27 sa 0001 0001 iv[16] enc(client_random)[16]            cmac[16]
//! serverResponseSeed 67 sa 0002      iv[16] enc(server_random|server_proof)[32] cmac[16]
//! clientSendKey      27 sa 0003      iv[16] enc(client_proof)[16]             cmac[16]
//! ```

use std::fmt;

use aes::Aes128;
use cmac::digest::KeyInit;
use cmac::{Cmac, Mac};
use ctr::cipher::{KeyIvInit, StreamCipher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SecurityError};
use crate::session::check_seed_level;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const BLOCK_LEN: usize = 16;
pub type Block = [u8; BLOCK_LEN];

pub const MESSAGE_ID_REQUEST_SEED: u16 = 0x0001;
pub const MESSAGE_ID_RESPONSE_SEED: u16 = 0x0002;
pub const MESSAGE_ID_SEND_KEY: u16 = 0x0003;
pub const AUTH_METHOD_AES: u16 = 0x0001;

const SECURITY_ACCESS: u8 = 0x27;
const SECURITY_ACCESS_RESPONSE: u8 = 0x67;

/// Shared secrets for the authenticated method
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthKeys {
    #[serde(with = "crate::hex_array")]
    pub auth_key: Block,
    #[serde(with = "crate::hex_array")]
    pub proof_key: Block,
}

impl AuthKeys {
    pub fn new(auth_key: Block, proof_key: Block) -> Self {
        Self { auth_key, proof_key }
    }
}

impl fmt::Debug for AuthKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKeys")
            .field("auth_key", &"<redacted>")
            .field("proof_key", &"<redacted>")
            .finish()
    }
}

fn new_mac(key: &Block) -> Cmac<Aes128> {
    <Cmac<Aes128> as KeyInit>::new(key.into())
}

/// AES-128-CMAC over the concatenation of `parts`
pub fn cmac(key: &Block, parts: &[&[u8]]) -> Block {
    let mut mac = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn cmac_matches(key: &Block, parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// AES-128-CTR; encryption and decryption are the same operation
pub fn apply_ctr(key: &Block, iv: &Block, buf: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// `CMAC(proof_key, server_random || client_random)`
pub fn server_proof(keys: &AuthKeys, server_random: &Block, client_random: &Block) -> Block {
    cmac(&keys.proof_key, &[server_random, client_random])
}

/// `CMAC(proof_key, client_random || server_random)`
pub fn client_proof(keys: &AuthKeys, client_random: &Block, server_random: &Block) -> Block {
    cmac(&keys.proof_key, &[client_random, server_random])
}

fn random_block() -> Block {
    rand::random()
}

fn block_at(bytes: &[u8], offset: usize) -> Block {
    let mut block = [0u8; BLOCK_LEN];
    block.copy_from_slice(&bytes[offset..offset + BLOCK_LEN]);
    block
}

fn seal(keys: &AuthKeys, mut message: Vec<u8>) -> Vec<u8> {
    let tag = cmac(&keys.auth_key, &[&message]);
    message.extend_from_slice(&tag);
    message
}

/// Length and CMAC checks shared by all three messages. Nothing past the
/// tag check looks at message content.
fn authenticate<'a>(
    keys: &AuthKeys,
    message: &'a [u8],
    expected_len: usize,
    name: &'static str,
) -> Result<&'a [u8]> {
    if message.len() != expected_len {
        return Err(SecurityError::InvalidLength {
            message: name,
            expected: expected_len,
            actual: message.len(),
        });
    }
    let (body, tag) = message.split_at(expected_len - BLOCK_LEN);
    if !cmac_matches(&keys.auth_key, &[body], tag) {
        warn!(kind = name, data = %hex::encode_upper(message), "CMAC verification failed");
        return Err(SecurityError::AuthenticationFailed(name));
    }
    Ok(body)
}

fn check_sid(actual: u8, expected: u8) -> Result<()> {
    if actual != expected {
        return Err(SecurityError::UnexpectedServiceId { expected, actual });
    }
    Ok(())
}

fn check_message_id(body: &[u8], expected: u16) -> Result<()> {
    let actual = u16::from_be_bytes([body[2], body[3]]);
    if actual != expected {
        return Err(SecurityError::UnexpectedMessageId { expected, actual });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequestSeed {
    pub sa_type: u8,
    pub iv: Block,
    pub client_random: Block,
}

impl ClientRequestSeed {
    pub const LEN: usize = 2 + 2 + 2 + BLOCK_LEN * 3;

    pub fn encode(&self, keys: &AuthKeys) -> Vec<u8> {
        let mut encrypted = self.client_random;
        apply_ctr(&keys.auth_key, &self.iv, &mut encrypted);

        let mut message = Vec::with_capacity(Self::LEN);
        message.extend_from_slice(&[SECURITY_ACCESS, self.sa_type]);
        message.extend_from_slice(&MESSAGE_ID_REQUEST_SEED.to_be_bytes());
        message.extend_from_slice(&AUTH_METHOD_AES.to_be_bytes());
        message.extend_from_slice(&self.iv);
        message.extend_from_slice(&encrypted);
        seal(keys, message)
    }

    pub fn decode(message: &[u8], keys: &AuthKeys) -> Result<Self> {
        let body = authenticate(keys, message, Self::LEN, "clientRequestSeed")?;
        check_sid(body[0], SECURITY_ACCESS)?;
        check_message_id(body, MESSAGE_ID_REQUEST_SEED)?;
        let method = u16::from_be_bytes([body[4], body[5]]);
        if method != AUTH_METHOD_AES {
            return Err(SecurityError::UnsupportedAuthMethod(method));
        }

        let iv = block_at(body, 6);
        let mut client_random = block_at(body, 6 + BLOCK_LEN);
        apply_ctr(&keys.auth_key, &iv, &mut client_random);
        Ok(Self {
            sa_type: body[1],
            iv,
            client_random,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponseSeed {
    pub sa_type: u8,
    pub iv: Block,
    pub server_random: Block,
    pub server_proof: Block,
}

impl ServerResponseSeed {
    pub const LEN: usize = 2 + 2 + BLOCK_LEN * 4;

    pub fn encode(&self, keys: &AuthKeys) -> Vec<u8> {
        let mut encrypted = [0u8; BLOCK_LEN * 2];
        encrypted[..BLOCK_LEN].copy_from_slice(&self.server_random);
        encrypted[BLOCK_LEN..].copy_from_slice(&self.server_proof);
        apply_ctr(&keys.auth_key, &self.iv, &mut encrypted);

        let mut message = Vec::with_capacity(Self::LEN);
        message.extend_from_slice(&[SECURITY_ACCESS_RESPONSE, self.sa_type]);
        message.extend_from_slice(&MESSAGE_ID_RESPONSE_SEED.to_be_bytes());
        message.extend_from_slice(&self.iv);
        message.extend_from_slice(&encrypted);
        seal(keys, message)
    }

    pub fn decode(message: &[u8], keys: &AuthKeys) -> Result<Self> {
        let body = authenticate(keys, message, Self::LEN, "serverResponseSeed")?;
        check_sid(body[0], SECURITY_ACCESS_RESPONSE)?;
        check_message_id(body, MESSAGE_ID_RESPONSE_SEED)?;

        let iv = block_at(body, 4);
        let mut decrypted = [0u8; BLOCK_LEN * 2];
        decrypted.copy_from_slice(&body[4 + BLOCK_LEN..4 + BLOCK_LEN * 3]);
        apply_ctr(&keys.auth_key, &iv, &mut decrypted);
        Ok(Self {
            sa_type: body[1],
            iv,
            server_random: block_at(&decrypted, 0),
            server_proof: block_at(&decrypted, BLOCK_LEN),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSendKey {
    pub sa_type: u8,
    pub iv: Block,
    pub client_proof: Block,
}

impl ClientSendKey {
    pub const LEN: usize = 2 + 2 + BLOCK_LEN * 3;

    pub fn encode(&self, keys: &AuthKeys) -> Vec<u8> {
        let mut encrypted = self.client_proof;
        apply_ctr(&keys.auth_key, &self.iv, &mut encrypted);

        let mut message = Vec::with_capacity(Self::LEN);
        message.extend_from_slice(&[SECURITY_ACCESS, self.sa_type]);
        message.extend_from_slice(&MESSAGE_ID_SEND_KEY.to_be_bytes());
        message.extend_from_slice(&self.iv);
        message.extend_from_slice(&encrypted);
        seal(keys, message)
    }

    pub fn decode(message: &[u8], keys: &AuthKeys) -> Result<Self> {
        let body = authenticate(keys, message, Self::LEN, "clientSendKey")?;
        check_sid(body[0], SECURITY_ACCESS)?;
        check_message_id(body, MESSAGE_ID_SEND_KEY)?;

        let iv = block_at(body, 4);
        let mut client_proof = block_at(body, 4 + BLOCK_LEN);
        apply_ctr(&keys.auth_key, &iv, &mut client_proof);
        Ok(Self {
            sa_type: body[1],
            iv,
            client_proof,
        })
    }
}

/// Tester side of the handshake for one security level
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    keys: AuthKeys,
    level: u8,
    client_random: Option<Block>,
}

impl ClientHandshake {
    pub fn new(keys: AuthKeys, level: u8) -> Result<Self> {
        check_seed_level(level)?;
        Ok(Self {
            keys,
            level,
            client_random: None,
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn request_seed(&mut self) -> Vec<u8> {
        self.request_seed_with(random_block(), random_block())
    }

    pub fn request_seed_with(&mut self, iv: Block, client_random: Block) -> Vec<u8> {
        self.client_random = Some(client_random);
        ClientRequestSeed {
            sa_type: self.level,
            iv,
            client_random,
        }
        .encode(&self.keys)
    }

    /// Check the ECU's proof and build the sendKey request
    pub fn send_key(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        self.send_key_with(response, random_block())
    }

    pub fn send_key_with(&mut self, response: &[u8], iv: Block) -> Result<Vec<u8>> {
        let client_random = self
            .client_random
            .take()
            .ok_or(SecurityError::SeedNotRequested(self.level))?;
        let seed = ServerResponseSeed::decode(response, &self.keys)?;
        if seed.sa_type != self.level {
            return Err(SecurityError::InvalidLevel(seed.sa_type));
        }
        if !cmac_matches(
            &self.keys.proof_key,
            &[&seed.server_random, &client_random],
            &seed.server_proof,
        ) {
            return Err(SecurityError::ProofMismatch);
        }
        debug!(level = format!("0x{:02X}", self.level), "Server proof verified");

        Ok(ClientSendKey {
            sa_type: self.level + 1,
            iv,
            client_proof: client_proof(&self.keys, &client_random, &seed.server_random),
        }
        .encode(&self.keys))
    }
}

/// ECU side of the handshake for one security level
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    keys: AuthKeys,
    level: u8,
    nonces: Option<(Block, Block)>,
}

impl ServerHandshake {
    pub fn new(keys: AuthKeys, level: u8) -> Result<Self> {
        check_seed_level(level)?;
        Ok(Self {
            keys,
            level,
            nonces: None,
        })
    }

    /// Authenticate a clientRequestSeed and answer with a serverResponseSeed
    pub fn respond_seed(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.respond_seed_with(request, random_block(), random_block())
    }

    pub fn respond_seed_with(&mut self, request: &[u8], iv: Block, server_random: Block) -> Result<Vec<u8>> {
        let request = ClientRequestSeed::decode(request, &self.keys)?;
        if request.sa_type != self.level {
            return Err(SecurityError::InvalidLevel(request.sa_type));
        }
        self.nonces = Some((request.client_random, server_random));

        Ok(ServerResponseSeed {
            sa_type: self.level,
            iv,
            server_random,
            server_proof: server_proof(&self.keys, &server_random, &request.client_random),
        }
        .encode(&self.keys))
    }

    /// Authenticate a clientSendKey and check the client's proof.
    /// The nonces are consumed whatever the outcome.
    pub fn verify_key(&mut self, request: &[u8]) -> Result<()> {
        let (client_random, server_random) = self
            .nonces
            .take()
            .ok_or(SecurityError::SeedNotRequested(self.level))?;
        let key = ClientSendKey::decode(request, &self.keys)?;
        if key.sa_type != self.level + 1 {
            return Err(SecurityError::InvalidLevel(key.sa_type));
        }
        if !cmac_matches(
            &self.keys.proof_key,
            &[&client_random, &server_random],
            &key.client_proof,
        ) {
            return Err(SecurityError::ProofMismatch);
        }
        Ok(())
    }

    pub fn has_pending_seed(&self) -> bool {
        self.nonces.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block(text: &str) -> Block {
        crate::hex_array::parse::<BLOCK_LEN>(text).unwrap()
    }

    fn keys() -> AuthKeys {
        AuthKeys::new(
            block("000102030405060708090A0B0C0D0E0F"),
            block("F0E0D0C0B0A090807060504030201000"),
        )
    }

    #[test]
    fn test_cmac_reference_vectors() {
        let key = block("2B7E151628AED2A6ABF7158809CF4F3C");
        assert_eq!(cmac(&key, &[]), block("BB1D6929E95937287FA37D129B756746"));
        let message = block("6BC1BEE22E409F96E93D7E117393172A");
        assert_eq!(cmac(&key, &[&message]), block("070A16B46B4D4144F79BDD9DD04A287C"));
        // split input gives the same tag
        assert_eq!(
            cmac(&key, &[&message[..5], &message[5..]]),
            block("070A16B46B4D4144F79BDD9DD04A287C")
        );
    }

    #[test]
    fn test_ctr_reference_vector() {
        let key = block("2B7E151628AED2A6ABF7158809CF4F3C");
        let iv = block("F0F1F2F3F4F5F6F7F8F9FAFBFCFDFEFF");
        let mut data = block("6BC1BEE22E409F96E93D7E117393172A");
        apply_ctr(&key, &iv, &mut data);
        assert_eq!(data, block("874D6191B620E3261BEF6864990DB6CE"));
        apply_ctr(&key, &iv, &mut data);
        assert_eq!(data, block("6BC1BEE22E409F96E93D7E117393172A"));
    }

    #[test]
    fn test_request_seed_layout() {
        let mut client = ClientHandshake::new(keys(), 0x01).unwrap();
        let iv = [0x11; 16];
        let message = client.request_seed_with(iv, [0x22; 16]);

        assert_eq!(message.len(), ClientRequestSeed::LEN);
        assert_eq!(&message[..6], &[0x27, 0x01, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&message[6..22], &iv);
        assert_ne!(&message[22..38], &[0x22; 16]);

        let decoded = ClientRequestSeed::decode(&message, &keys()).unwrap();
        assert_eq!(decoded.client_random, [0x22; 16]);
        assert_eq!(decoded.sa_type, 0x01);
    }

    #[test]
    fn test_any_bit_flip_fails_authentication() {
        let mut client = ClientHandshake::new(keys(), 0x01).unwrap();
        let message = client.request_seed_with([0x11; 16], [0x22; 16]);

        for bit in 0..message.len() * 8 {
            let mut corrupted = message.clone();
            corrupted[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(
                ClientRequestSeed::decode(&corrupted, &keys()),
                Err(SecurityError::AuthenticationFailed("clientRequestSeed")),
                "bit {}",
                bit
            );
        }
    }

    #[test]
    fn test_wrong_message_id_rejected_after_cmac() {
        let mut body = vec![0x27, 0x01, 0x00, 0x03, 0x00, 0x01];
        body.extend_from_slice(&[0u8; 32]);
        let message = seal(&keys(), body);
        assert_eq!(
            ClientRequestSeed::decode(&message, &keys()),
            Err(SecurityError::UnexpectedMessageId {
                expected: MESSAGE_ID_REQUEST_SEED,
                actual: MESSAGE_ID_SEND_KEY,
            })
        );
    }

    #[test]
    fn test_wrong_auth_method_rejected() {
        let mut body = vec![0x27, 0x01, 0x00, 0x01, 0x00, 0x02];
        body.extend_from_slice(&[0u8; 32]);
        let message = seal(&keys(), body);
        assert_eq!(
            ClientRequestSeed::decode(&message, &keys()),
            Err(SecurityError::UnsupportedAuthMethod(0x0002))
        );
    }

    #[test]
    fn test_length_checked() {
        assert!(matches!(
            ClientSendKey::decode(&[0x27, 0x02], &keys()),
            Err(SecurityError::InvalidLength { expected: 52, actual: 2, .. })
        ));
    }

    #[test]
    fn test_full_handshake() {
        let mut client = ClientHandshake::new(keys(), 0x01).unwrap();
        let mut server = ServerHandshake::new(keys(), 0x01).unwrap();

        let request = client.request_seed();
        let response = server.respond_seed(&request).unwrap();
        assert_eq!(response.len(), ServerResponseSeed::LEN);
        assert_eq!(&response[..4], &[0x67, 0x01, 0x00, 0x02]);

        let key = client.send_key(&response).unwrap();
        assert_eq!(key.len(), ClientSendKey::LEN);
        assert_eq!(&key[..4], &[0x27, 0x02, 0x00, 0x03]);

        server.verify_key(&key).unwrap();
        assert!(!server.has_pending_seed());
    }

    #[test]
    fn test_proofs_are_order_dependent() {
        let k = keys();
        let a = [0x01; 16];
        let b = [0x02; 16];
        assert_eq!(server_proof(&k, &a, &b), client_proof(&k, &a, &b));
        assert_ne!(server_proof(&k, &a, &b), server_proof(&k, &b, &a));
    }

    #[test]
    fn test_wrong_proof_key_is_detected() {
        let mut client = ClientHandshake::new(keys(), 0x01).unwrap();
        let mut other = keys();
        other.proof_key = [0xAA; 16];
        let mut server = ServerHandshake::new(other, 0x01).unwrap();

        let response = server.respond_seed(&client.request_seed()).unwrap();
        assert_eq!(client.send_key(&response), Err(SecurityError::ProofMismatch));
    }

    #[test]
    fn test_wrong_auth_key_is_detected() {
        let mut client = ClientHandshake::new(keys(), 0x01).unwrap();
        let mut other = keys();
        other.auth_key = [0xAA; 16];
        let mut server = ServerHandshake::new(other, 0x01).unwrap();

        assert_eq!(
            server.respond_seed(&client.request_seed()),
            Err(SecurityError::AuthenticationFailed("clientRequestSeed"))
        );
    }

    #[test]
    fn test_key_without_seed() {
        let mut client = ClientHandshake::new(keys(), 0x01).unwrap();
        let mut server = ServerHandshake::new(keys(), 0x01).unwrap();
        let response = server.respond_seed(&client.request_seed()).unwrap();
        let key = client.send_key(&response).unwrap();

        server.verify_key(&key).unwrap();
        // replaying the same key needs a fresh seed
        assert_eq!(server.verify_key(&key), Err(SecurityError::SeedNotRequested(0x01)));
        assert_eq!(client.send_key(&response), Err(SecurityError::SeedNotRequested(0x01)));
    }

    #[test]
    fn test_even_level_rejected() {
        assert_eq!(
            ClientHandshake::new(keys(), 0x02).unwrap_err(),
            SecurityError::InvalidLevel(0x02)
        );
    }

    #[test]
    fn test_reserved_levels_rejected() {
        assert!(ClientHandshake::new(keys(), 0x7D).is_ok());
        for level in [0x7F, 0xFF] {
            assert_eq!(
                ClientHandshake::new(keys(), level).unwrap_err(),
                SecurityError::InvalidLevel(level)
            );
            assert!(matches!(
                ServerHandshake::new(keys(), level),
                Err(SecurityError::InvalidLevel(_))
            ));
        }
    }

    #[test]
    fn test_keys_debug_is_redacted() {
        let text = format!("{:?}", keys());
        assert!(!text.contains("000102"));
        assert!(text.contains("redacted"));
    }
}
