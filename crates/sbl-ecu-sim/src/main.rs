//! Simulated bootloader ECU on a SocketCAN interface
//!
//! ```bash
//! ./sbl-ecu-sim --interface vcan0
//! ./sbl-ecu-sim --config crates/sbl-ecu-sim/config/sim-ecu.toml
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sbl_ecu_sim::{EcuConfig, EcuServer, SimulatedEcu};
use sbl_transport::{CanBus, IsoTpConfig, SignalId};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sbl-ecu-sim")]
#[command(about = "Simulated ECU with PBL/SBL programming support")]
struct Args {
    /// Configuration file (TOML or YAML); overrides the options below
    #[arg(short, long)]
    config: Option<String>,

    /// CAN interface name
    #[arg(short, long, default_value = "vcan0")]
    interface: String,

    /// ECU receive CAN ID (tester requests)
    #[arg(long, default_value = "0x7E0")]
    rx_id: String,

    /// ECU transmit CAN ID
    #[arg(long, default_value = "0x7E8")]
    tx_id: String,

    /// Support the check-memory routine
    #[arg(long)]
    check_memory: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "sbl_ecu_sim=debug,sbl_security=debug"
    } else {
        "sbl_ecu_sim=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path);
            EcuConfig::load(path).with_context(|| format!("Failed to load {}", path))?
        }
        None => {
            let mut config = EcuConfig::default();
            config.transport.interface = args.interface.clone();
            config.transport.rx_id = args.rx_id.clone();
            config.transport.tx_id = args.tx_id.clone();
            config.programming.check_memory = args.check_memory;
            config
        }
    };

    info!(
        interface = %config.transport.interface,
        rx_id = %config.transport.rx_id,
        tx_id = %config.transport.tx_id,
        "Starting simulated ECU"
    );
    if !config.faults.negative_responses.is_empty() || config.faults.corrupt_transfer_echo {
        warn!(faults = ?config.faults, "Fault injection enabled");
    }

    let request = SignalId::new("Request", "Diag");
    let response = SignalId::new("Response", "Diag");
    let functional = SignalId::new("Functional", "Diag");
    let bus = open_bus(&config, &request, &response, &functional)?;

    let ecu = Arc::new(SimulatedEcu::new(&config)?);
    let handle = EcuServer::new(ecu, bus, IsoTpConfig::new(response, request))
        .with_functional(functional)
        .spawn();

    info!("ECU simulator ready - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.shutdown().await;
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn open_bus(
    config: &EcuConfig,
    request: &SignalId,
    response: &SignalId,
    functional: &SignalId,
) -> Result<Arc<dyn CanBus>> {
    let routes = [
        (request.clone(), config.transport.rx_can_id()?),
        (response.clone(), config.transport.tx_can_id()?),
        (functional.clone(), config.transport.functional_can_id()?),
    ];
    let bus = sbl_transport::socketcan::SocketCanBus::open(&config.transport.interface, routes)?;
    Ok(Arc::new(bus))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn open_bus(
    _config: &EcuConfig,
    _request: &SignalId,
    _response: &SignalId,
    _functional: &SignalId,
) -> Result<Arc<dyn CanBus>> {
    anyhow::bail!("SocketCAN support is not available in this build")
}
