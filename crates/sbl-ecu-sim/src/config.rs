//! Simulated ECU configuration
//!
//! Loaded from TOML or YAML. Every section has defaults, so an empty file
//! gives a PBL-style ECU on 0x7E0/0x7E8 with one legacy security level.

use std::path::Path;

use sbl_security::{DelayTimerConfig, FixedKey, SecurityAlgorithm};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::uds::session;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    #[serde(default)]
    pub transport: SimTransportConfig,
    #[serde(default)]
    pub security: SimSecurityConfig,
    #[serde(default)]
    pub programming: ProgrammingConfig,
    /// Extra DIDs besides F186
    #[serde(default = "default_dids")]
    pub dids: Vec<DidDef>,
    #[serde(default)]
    pub faults: FaultConfig,
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            transport: SimTransportConfig::default(),
            security: SimSecurityConfig::default(),
            programming: ProgrammingConfig::default(),
            dids: default_dids(),
            faults: FaultConfig::default(),
        }
    }
}

impl EcuConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_toml(&content),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SimError::Config(e.to_string()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| SimError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimTransportConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    /// ECU receive CAN ID (tester requests)
    #[serde(default = "default_rx_id")]
    pub rx_id: String,
    /// ECU transmit CAN ID
    #[serde(default = "default_tx_id")]
    pub tx_id: String,
    #[serde(default = "default_functional_id")]
    pub functional_id: String,
}

fn default_interface() -> String {
    "vcan0".to_string()
}

fn default_rx_id() -> String {
    "0x7E0".to_string()
}

fn default_tx_id() -> String {
    "0x7E8".to_string()
}

fn default_functional_id() -> String {
    "0x7DF".to_string()
}

impl Default for SimTransportConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            rx_id: default_rx_id(),
            tx_id: default_tx_id(),
            functional_id: default_functional_id(),
        }
    }
}

impl SimTransportConfig {
    pub fn rx_can_id(&self) -> Result<u32> {
        parse_can_id(&self.rx_id)
    }

    pub fn tx_can_id(&self) -> Result<u32> {
        parse_can_id(&self.tx_id)
    }

    pub fn functional_can_id(&self) -> Result<u32> {
        parse_can_id(&self.functional_id)
    }
}

pub fn parse_can_id(s: &str) -> Result<u32> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map_err(|e| SimError::Config(format!("Invalid CAN ID '{}': {}", s, e)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSecurityConfig {
    #[serde(default)]
    pub delay_timer: DelayTimerConfig,
    #[serde(default = "default_levels")]
    pub levels: Vec<SecurityLevelDef>,
}

impl Default for SimSecurityConfig {
    fn default() -> Self {
        Self {
            delay_timer: DelayTimerConfig::default(),
            levels: default_levels(),
        }
    }
}

/// One requestSeed level and the handshake it speaks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLevelDef {
    pub level: u8,
    pub algorithm: SecurityAlgorithm,
}

pub const DEFAULT_FIXED_KEY: FixedKey = FixedKey::new([0x01, 0x02, 0x03, 0x04, 0x05]);

fn default_levels() -> Vec<SecurityLevelDef> {
    vec![SecurityLevelDef {
        level: 0x01,
        algorithm: SecurityAlgorithm::Legacy {
            fixed_key: DEFAULT_FIXED_KEY,
        },
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgrammingConfig {
    /// Session after power-up
    #[serde(default = "default_initial_session")]
    pub initial_session: u8,
    /// Supports the check-memory routine; transfer exit then carries no CRC
    #[serde(default)]
    pub check_memory: bool,
    /// maxNumberOfBlockLength advertised in RequestDownload responses
    #[serde(default = "default_max_block_length")]
    pub max_block_length: u16,
    /// Response-pending NRCs sent before each erase result
    #[serde(default)]
    pub erase_pending_responses: u8,
}

fn default_initial_session() -> u8 {
    session::DEFAULT
}

fn default_max_block_length() -> u16 {
    0x0202
}

impl Default for ProgrammingConfig {
    fn default() -> Self {
        Self {
            initial_session: default_initial_session(),
            check_memory: false,
            max_block_length: default_max_block_length(),
            erase_pending_responses: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidDef {
    pub did: u16,
    /// Value as a hex string
    pub value: String,
    #[serde(default)]
    pub writable: bool,
}

fn default_dids() -> Vec<DidDef> {
    vec![
        DidDef {
            did: 0xF190,
            value: hex::encode_upper(b"YV1SIM00000000001"),
            writable: false,
        },
        DidDef {
            did: 0xF188,
            value: hex::encode_upper(b"32218941 AA"),
            writable: false,
        },
        DidDef {
            did: 0xF199,
            value: "00000000".to_string(),
            writable: true,
        },
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Answer these services with a fixed NRC
    #[serde(default)]
    pub negative_responses: Vec<ForcedNrc>,
    /// Echo a wrong block counter in TransferData responses
    #[serde(default)]
    pub corrupt_transfer_echo: bool,
    /// Report check-memory as failed
    #[serde(default)]
    pub fail_check_memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedNrc {
    pub service: u8,
    pub nrc: u8,
}
