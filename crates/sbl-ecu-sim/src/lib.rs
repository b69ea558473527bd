//! sbl-ecu-sim - simulated ECU for SBL flashing
//!
//! A [`SimulatedEcu`] answers UDS requests the way a PBL/SBL bootloader
//! does: sessions, SecurityAccess with a delay timer, erase, block download
//! with CRC16 and LZSS, SBL activation and the programming check routines.
//!
//! It is reachable in-process through [`LoopbackTransport`], or over ISO-TP
//! on any [`sbl_transport::CanBus`] through [`EcuServer`].

pub mod config;
pub mod ecu;
pub mod error;
pub mod loopback;
pub mod server;
pub mod uds;

pub use config::{
    parse_can_id, DidDef, EcuConfig, FaultConfig, ForcedNrc, ProgrammingConfig,
    SecurityLevelDef, SimSecurityConfig, SimTransportConfig, DEFAULT_FIXED_KEY,
};
pub use ecu::SimulatedEcu;
pub use error::{Result, SimError};
pub use loopback::LoopbackTransport;
pub use server::{EcuServer, EcuServerHandle};
