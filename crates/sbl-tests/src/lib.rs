//! End-to-end tests for SBL flashing
//!
//! Everything runs in-process: the tester stack talks either ISO-TP over a
//! [`VirtualBus`] to an [`EcuServer`], or straight into the simulated ECU
//! through a [`LoopbackTransport`] when a test needs paused time.
//!
//! ```bash
//! cargo test -p sbl-tests
//! ```
//!
//! # Test Structure
//!
//! - `flash_sequence.rs` - full SBL runs, compression, counter wrap, aborts
//! - `security_access.rs` - seed/key handshakes, delay timer, rate limit
//! - `vbf_files.rs` - VBF files on disk through config and catalog

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sbl_ecu_sim::{EcuConfig, EcuServer, EcuServerHandle, LoopbackTransport, SimulatedEcu};
use sbl_security::{DelayTimerConfig, FixedKey, SecurityAlgorithm};
use sbl_transport::{
    IncomingMessage, IsoTpChannel, IsoTpConfig, SignalId, TransportAdapter, TransportSession,
    VirtualBus,
};
use sbl_transport::error::Result as TransportResult;
use tokio::sync::broadcast;
use sbl_uds::{
    EcuCapability, EcuSettings, FlashConfig, SecurityConfig, SecurityProfile, TimingConfig,
    TransportSettings, UdsService, VbfSource,
};
use sbl_vbf::{SwPartType, VbfBuilder, VbfCatalog, VbfFile};

pub const FIXED_KEY: FixedKey = FixedKey::new([0x01, 0x02, 0x03, 0x04, 0x05]);

pub const SBL_ADDRESS: u32 = 0x0000_2000;
pub const APP_ADDRESS: u32 = 0x0001_0000;
pub const APP_DATA_ADDRESS: u32 = 0x0001_8000;

/// Log to the test writer; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Simulated ECU without boot delay or seed rate limit
pub fn ecu_config(check_memory: bool) -> EcuConfig {
    let mut config = EcuConfig::default();
    config.security.delay_timer = DelayTimerConfig::relaxed();
    config.programming.check_memory = check_memory;
    config
}

/// Tester configuration matching [`ecu_config`]
pub fn flash_config(check_memory: bool) -> FlashConfig {
    FlashConfig {
        transport: TransportSettings::default(),
        security: SecurityConfig {
            delay_ms: 10_000,
            programming: SecurityProfile {
                level: 0x01,
                algorithm: SecurityAlgorithm::Legacy {
                    fixed_key: FIXED_KEY,
                },
            },
            application: None,
        },
        vbf: VbfSource::default(),
        timing: TimingConfig {
            request_timeout_ms: 1000,
            pending_timeout_ms: 2000,
            tester_present_ms: 0,
        },
        ecu: EcuSettings {
            capability: EcuCapability { check_memory },
            reset_after_flash: true,
        },
        base_dir: None,
    }
}

/// Deterministic, poorly compressible test data
pub fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt) ^ (i >> 8) as u8)
        .collect()
}

pub fn sbl_file() -> VbfFile {
    build(
        VbfBuilder::new(SwPartType::Sbl)
            .part_number("32218941")
            .call(SBL_ADDRESS)
            .block(SBL_ADDRESS, pattern(300, 0x11)),
    )
}

pub fn application_file(compressed: bool) -> VbfFile {
    let mut builder = VbfBuilder::new(SwPartType::Exe)
        .part_number("32218942")
        .erase(APP_ADDRESS, 0x1_0000)
        .sw_signature_dev(vec![0xDE, 0xAD, 0xBE, 0xEF])
        .block(APP_ADDRESS, pattern(1000, 0x22))
        .block(APP_DATA_ADDRESS, vec![0xFF; 512]);
    if compressed {
        builder = builder.compressed();
    }
    build(builder)
}

pub fn catalog(compressed: bool) -> VbfCatalog {
    match VbfCatalog::from_files([sbl_file(), application_file(compressed)]) {
        Ok(catalog) => catalog,
        Err(e) => panic!("test catalog: {}", e),
    }
}

fn build(builder: VbfBuilder) -> VbfFile {
    match builder.build_file() {
        Ok(file) => file,
        Err(e) => panic!("test VBF: {}", e),
    }
}

/// Tester and simulated ECU joined by ISO-TP on a virtual bus
pub struct Bench {
    pub bus: Arc<VirtualBus>,
    pub ecu: Arc<SimulatedEcu>,
    pub uds: UdsService,
    server: EcuServerHandle,
}

impl Bench {
    /// Must be called inside a Tokio runtime
    pub fn start(config: &EcuConfig) -> Self {
        let request = SignalId::new("Request", "Diag");
        let response = SignalId::new("Response", "Diag");
        let tester_link = IsoTpConfig::new(request, response);

        let bus = Arc::new(VirtualBus::new());
        let ecu = match SimulatedEcu::new(config) {
            Ok(ecu) => Arc::new(ecu),
            Err(e) => panic!("simulated ECU: {}", e),
        };
        let server = EcuServer::new(ecu.clone(), bus.clone(), tester_link.reversed()).spawn();
        let channel = IsoTpChannel::new(bus.clone(), Arc::new(TransportSession::new()), tester_link);

        Self {
            bus,
            ecu,
            uds: UdsService::new(Arc::new(channel)),
            server,
        }
    }

    pub async fn stop(self) {
        self.server.shutdown().await;
    }
}

/// Tester wired straight into a simulated ECU
pub fn loopback(config: &EcuConfig) -> (Arc<SimulatedEcu>, UdsService) {
    let ecu = match SimulatedEcu::new(config) {
        Ok(ecu) => Arc::new(ecu),
        Err(e) => panic!("simulated ECU: {}", e),
    };
    let transport = Arc::new(LoopbackTransport::new(ecu.clone()));
    (ecu, UdsService::new(transport))
}

/// Passes requests through and remembers each one
pub struct RecordingTransport {
    inner: Arc<dyn TransportAdapter>,
    requests: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    pub fn new(inner: Arc<dyn TransportAdapter>) -> Self {
        Self {
            inner,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests whose first byte is `service_id`, in order
    pub fn requests_for(&self, service_id: u8) -> Vec<Vec<u8>> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.first() == Some(&service_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransportAdapter for RecordingTransport {
    async fn send_receive(&self, request: &[u8], timeout: Duration) -> TransportResult<Vec<u8>> {
        self.requests.lock().push(request.to_vec());
        self.inner.send_receive(request, timeout).await
    }

    async fn send(&self, request: &[u8]) -> TransportResult<()> {
        self.requests.lock().push(request.to_vec());
        self.inner.send(request).await
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Vec<u8>> {
        self.inner.receive(timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.inner.subscribe()
    }
}

/// Like [`loopback`], recording every request the tester sends
pub fn recorded_loopback(
    config: &EcuConfig,
) -> (Arc<SimulatedEcu>, Arc<RecordingTransport>, UdsService) {
    let ecu = match SimulatedEcu::new(config) {
        Ok(ecu) => Arc::new(ecu),
        Err(e) => panic!("simulated ECU: {}", e),
    };
    let recorder = Arc::new(RecordingTransport::new(Arc::new(LoopbackTransport::new(ecu.clone()))));
    (ecu, recorder.clone(), UdsService::new(recorder))
}
