//! Flash configuration
//!
//! Loaded from TOML or YAML, picked by file extension.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sbl_security::SecurityAlgorithm;
use sbl_transport::{FlowControlParams, ReassemblyMode};
use sbl_vbf::{VbfCatalog, VbfFile};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, UdsError};
use crate::security::SecurityVariant;
use crate::transfer::EcuCapability;

/// Configuration for one flash run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    #[serde(default)]
    pub transport: TransportSettings,
    pub security: SecurityConfig,
    #[serde(default)]
    pub vbf: VbfSource,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub ecu: EcuSettings,
    /// Directory relative VBF paths resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl FlashConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| UdsError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content)?,
            _ => Self::from_toml(&content)?,
        };
        config.base_dir = path.parent().map(Path::to_path_buf);
        debug!(path = %path.display(), "Loaded flash configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| UdsError::Config(e.to_string()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| UdsError::Config(e.to_string()))
    }

    /// Files to download, classified by part type
    pub fn load_catalog(&self) -> Result<VbfCatalog> {
        let resolve = |path: &PathBuf| match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.clone(),
        };

        if let Some(dir) = &self.vbf.directory {
            return Ok(VbfCatalog::scan(resolve(dir))?);
        }

        let mut files = Vec::new();
        for path in self.vbf.sbl.iter().chain(&self.vbf.ess).chain(&self.vbf.application) {
            files.push(VbfFile::load(resolve(path))?);
        }
        if files.is_empty() {
            return Err(UdsError::Config(
                "No VBF directory or files configured".to_string(),
            ));
        }
        Ok(VbfCatalog::from_files(files)?)
    }
}

/// CAN addressing and ISO-TP options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Physical request CAN ID (tester -> ECU), e.g. "0x7E0"
    #[serde(default = "default_request_id")]
    pub request_id: String,
    /// Response CAN ID (ECU -> tester)
    #[serde(default = "default_response_id")]
    pub response_id: String,
    /// Functional request CAN ID, used for tester present
    #[serde(default = "default_functional_id")]
    pub functional_id: String,
    /// Flow control sent when receiving multi-frame responses
    #[serde(default)]
    pub flow_control: FlowControlParams,
    #[serde(default)]
    pub reassembly: ReassemblyMode,
    #[serde(default = "default_flow_control_timeout")]
    pub flow_control_timeout_ms: u64,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_request_id() -> String {
    "0x7E0".to_string()
}

fn default_response_id() -> String {
    "0x7E8".to_string()
}

fn default_functional_id() -> String {
    "0x7DF".to_string()
}

fn default_flow_control_timeout() -> u64 {
    1000
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            request_id: default_request_id(),
            response_id: default_response_id(),
            functional_id: default_functional_id(),
            flow_control: FlowControlParams::default(),
            reassembly: ReassemblyMode::default(),
            flow_control_timeout_ms: default_flow_control_timeout(),
        }
    }
}

impl TransportSettings {
    pub fn request_can_id(&self) -> Result<u32> {
        parse_can_id(&self.request_id)
    }

    pub fn response_can_id(&self) -> Result<u32> {
        parse_can_id(&self.response_id)
    }

    pub fn functional_can_id(&self) -> Result<u32> {
        parse_can_id(&self.functional_id)
    }
}

/// Parse a CAN ID written as hex, with or without `0x`
pub fn parse_can_id(text: &str) -> Result<u32> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let id = u32::from_str_radix(digits, 16)
        .map_err(|e| UdsError::Config(format!("Invalid CAN ID '{}': {}", text, e)))?;
    if id > 0x1FFF_FFFF {
        return Err(UdsError::Config(format!("CAN ID '{}' out of range", text)));
    }
    Ok(id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Delay the ECU applies after too many invalid keys
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Level and algorithm used in the programming session
    pub programming: SecurityProfile,
    /// Level and algorithm used in default/extended sessions ("mode1_3")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<SecurityProfile>,
}

fn default_delay_ms() -> u64 {
    10_000
}

impl SecurityConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Profile for the variant; application falls back to programming
    pub fn profile(&self, variant: SecurityVariant) -> &SecurityProfile {
        match variant {
            SecurityVariant::Programming => &self.programming,
            SecurityVariant::Application => self.application.as_ref().unwrap_or(&self.programming),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityProfile {
    /// requestSeed sub-function (odd)
    #[serde(default = "default_level")]
    pub level: u8,
    pub algorithm: SecurityAlgorithm,
}

fn default_level() -> u8 {
    0x01
}

/// Where the VBF files come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VbfSource {
    /// Directory scanned for `*.vbf`; wins over the explicit lists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sbl: Option<PathBuf>,
    #[serde(default)]
    pub ess: Vec<PathBuf>,
    #[serde(default)]
    pub application: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Response timeout for ordinary requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Timeout after each response-pending (0x78)
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_ms: u64,
    /// Functional tester present period; 0 disables it
    #[serde(default = "default_tester_present")]
    pub tester_present_ms: u64,
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_pending_timeout() -> u64 {
    5000
}

fn default_tester_present() -> u64 {
    2000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            pending_timeout_ms: default_pending_timeout(),
            tester_present_ms: default_tester_present(),
        }
    }
}

impl TimingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn tester_present_interval(&self) -> Option<Duration> {
        (self.tester_present_ms > 0).then(|| Duration::from_millis(self.tester_present_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuSettings {
    #[serde(flatten)]
    pub capability: EcuCapability,
    /// Hard reset once everything is downloaded
    #[serde(default = "default_true")]
    pub reset_after_flash: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EcuSettings {
    fn default() -> Self {
        Self {
            capability: EcuCapability::default(),
            reset_after_flash: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sbl_vbf::{SwPartType, VbfBuilder};

    const TOML: &str = r#"
[transport]
interface = "vcan0"
request_id = "0x726"
response_id = "0x72E"

[transport.flow_control]
block_size = 8
separation_time = 2

[security]
delay_ms = 5000

[security.programming]
level = 0x01
algorithm = { method = "legacy", fixed_key = "0102030405" }

[security.application]
level = 0x05
algorithm = { method = "aes", auth_key = "2B7E151628AED2A6ABF7158809CF4F3C", proof_key = "000102030405060708090A0B0C0D0E0F" }

[vbf]
directory = "images"

[ecu]
check_memory = true
"#;

    #[test]
    fn test_toml_config() {
        let config = FlashConfig::from_toml(TOML).unwrap();

        assert_eq!(config.transport.interface, "vcan0");
        assert_eq!(config.transport.request_can_id().unwrap(), 0x726);
        assert_eq!(config.transport.response_can_id().unwrap(), 0x72E);
        assert_eq!(config.transport.functional_can_id().unwrap(), 0x7DF);
        assert_eq!(config.transport.flow_control.block_size, 8);
        assert_eq!(config.transport.reassembly, ReassemblyMode::Strict);

        assert_eq!(config.security.delay(), Duration::from_secs(5));
        assert_eq!(config.security.profile(SecurityVariant::Programming).level, 0x01);
        let application = config.security.profile(SecurityVariant::Application);
        assert_eq!(application.level, 0x05);
        assert_eq!(application.algorithm.name(), "aes");

        assert!(config.ecu.capability.check_memory);
        assert!(config.ecu.reset_after_flash);
        assert_eq!(config.timing.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_yaml_config_with_defaults() {
        let yaml = r#"
security:
  programming:
    algorithm:
      method: legacy
      fixed_key: "0x0102030405"
vbf:
  sbl: sbl.vbf
  application: [app.vbf]
timing:
  tester_present_ms: 0
"#;
        let config = FlashConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.transport.request_can_id().unwrap(), 0x7E0);
        assert_eq!(config.security.delay_ms, 10_000);
        assert_eq!(config.security.programming.level, 0x01);
        assert_eq!(config.security.profile(SecurityVariant::Application).level, 0x01);
        assert!(!config.ecu.capability.check_memory);
        assert_eq!(config.timing.tester_present_interval(), None);
        assert_eq!(config.vbf.application, vec![PathBuf::from("app.vbf")]);
    }

    #[test]
    fn test_invalid_can_id() {
        assert_eq!(parse_can_id("7e8").unwrap(), 0x7E8);
        assert!(parse_can_id("0xZZ").is_err());
        assert!(parse_can_id("0x20000000").is_err());
    }

    #[test]
    fn test_missing_security_section() {
        assert!(matches!(
            FlashConfig::from_toml("[transport]\ninterface = \"can1\"\n"),
            Err(UdsError::Config(_))
        ));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("images")).unwrap();
        std::fs::write(
            dir.path().join("images").join("sbl.vbf"),
            VbfBuilder::new(SwPartType::Sbl).call(0x2000).block(0x2000, vec![1, 2, 3]).build(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("images").join("app.vbf"),
            VbfBuilder::new(SwPartType::Exe).block(0x10000, vec![4, 5]).build(),
        )
        .unwrap();
        let path = dir.path().join("flash.toml");
        std::fs::write(&path, TOML).unwrap();

        let config = FlashConfig::load(&path).unwrap();
        let catalog = config.load_catalog().unwrap();
        assert!(catalog.sbl.is_some());
        assert_eq!(catalog.application.len(), 1);
    }

    #[test]
    fn test_empty_vbf_source() {
        let mut config = FlashConfig::from_toml(TOML).unwrap();
        config.vbf = VbfSource::default();
        assert!(matches!(config.load_catalog(), Err(UdsError::Config(_))));
    }
}
