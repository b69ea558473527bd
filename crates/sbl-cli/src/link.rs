//! Tester side of the CAN link: SocketCAN or an in-process simulated ECU

use std::sync::Arc;

use anyhow::{Context, Result};
use sbl_ecu_sim::{EcuConfig, EcuServer, EcuServerHandle, SecurityLevelDef, SimulatedEcu};
use sbl_security::DelayTimerConfig;
use sbl_transport::{
    CanBus, IsoTpChannel, IsoTpConfig, PeriodicSender, SignalId, TransportSession, VirtualBus,
};
use sbl_uds::{FlashConfig, UdsService};
use tracing::info;

/// An open diagnostic link
pub struct Link {
    pub uds: UdsService,
    pub bus: Arc<dyn CanBus>,
    pub functional: SignalId,
    server: Option<EcuServerHandle>,
}

impl Link {
    pub async fn connect(config: &FlashConfig, simulate: bool) -> Result<Self> {
        let request = SignalId::new("Request", "Diag");
        let response = SignalId::new("Response", "Diag");
        let functional = SignalId::new("Functional", "Diag");

        let (bus, server): (Arc<dyn CanBus>, _) = if simulate {
            let bus: Arc<dyn CanBus> = Arc::new(VirtualBus::new());
            let ecu = Arc::new(SimulatedEcu::new(&simulated_ecu_config(config))?);
            let server = EcuServer::new(ecu, bus.clone(), IsoTpConfig::new(response.clone(), request.clone()))
                .with_functional(functional.clone())
                .spawn();
            info!("Using in-process simulated ECU");
            (bus, Some(server))
        } else {
            (open_bus(config, &request, &response, &functional)?, None)
        };

        let mut isotp = IsoTpConfig::new(request, response).with_mode(config.transport.reassembly);
        isotp.flow_control_timeout_ms = config.transport.flow_control_timeout_ms;
        let channel = IsoTpChannel::new(bus.clone(), Arc::new(TransportSession::new()), isotp);
        channel
            .set_flow_control(config.transport.flow_control.clone())
            .context("Invalid flow control parameters")?;

        Ok(Self {
            uds: UdsService::new(Arc::new(channel)),
            bus,
            functional,
            server,
        })
    }

    /// Periodic sender on the functional request signal
    pub fn tester_present_sender(&self) -> PeriodicSender {
        PeriodicSender::spawn(self.bus.clone(), self.functional.clone())
    }

    pub async fn close(self) {
        if let Some(server) = self.server {
            server.shutdown().await;
        }
    }
}

/// A simulated ECU that speaks the configured security profiles and
/// honors the configured ECU capabilities. No boot delay or seed limit.
pub fn simulated_ecu_config(config: &FlashConfig) -> EcuConfig {
    let mut ecu = EcuConfig::default();
    ecu.programming.check_memory = config.ecu.capability.check_memory;
    ecu.security.delay_timer = DelayTimerConfig {
        delay_ms: config.security.delay_ms,
        ..DelayTimerConfig::relaxed()
    };

    let mut levels: Vec<SecurityLevelDef> = Vec::new();
    let profiles = std::iter::once(&config.security.programming).chain(&config.security.application);
    for profile in profiles {
        if levels.iter().all(|l| l.level != profile.level) {
            levels.push(SecurityLevelDef {
                level: profile.level,
                algorithm: profile.algorithm.clone(),
            });
        }
    }
    ecu.security.levels = levels;
    ecu
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn open_bus(
    config: &FlashConfig,
    request: &SignalId,
    response: &SignalId,
    functional: &SignalId,
) -> Result<Arc<dyn CanBus>> {
    let routes = [
        (request.clone(), config.transport.request_can_id()?),
        (response.clone(), config.transport.response_can_id()?),
        (functional.clone(), config.transport.functional_can_id()?),
    ];
    info!(interface = %config.transport.interface, "Opening SocketCAN interface");
    let bus = sbl_transport::socketcan::SocketCanBus::open(&config.transport.interface, routes)?;
    Ok(Arc::new(bus))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn open_bus(
    _config: &FlashConfig,
    _request: &SignalId,
    _response: &SignalId,
    _functional: &SignalId,
) -> Result<Arc<dyn CanBus>> {
    anyhow::bail!("SocketCAN support is not available in this build; use --simulate")
}
