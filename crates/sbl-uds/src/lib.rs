//! sbl-uds - UDS programming client for secondary-bootloader downloads
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SblOrchestrator                         │
//! │  detect mode, session change, unlock, SBL, ESS, app, C&C    │
//! │                                                             │
//! │  ┌──────────────────────┐    ┌───────────────────────────┐  │
//! │  │ SecurityAccessEngine │    │ BlockTransfer             │  │
//! │  │ (legacy / AES)       │    │ (erase, 34/36/37, check)  │  │
//! │  └──────────┬───────────┘    └─────────────┬─────────────┘  │
//! │             └──────────────┬───────────────┘                │
//! │                      ┌─────┴─────┐                          │
//! │                      │UdsService │                          │
//! │                      └─────┬─────┘                          │
//! │                 ┌──────────┴───────┐                        │
//! │                 │ TransportAdapter │                        │
//! │                 │ (ISO-TP / mock)  │                        │
//! │                 └──────────────────┘                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod sbl;
pub mod security;
pub mod transfer;
pub mod uds;

pub use config::{
    parse_can_id, EcuSettings, FlashConfig, SecurityConfig, SecurityProfile, TimingConfig,
    TransportSettings, VbfSource,
};
pub use error::{Result, UdsError};
pub use sbl::{SblFailure, SblOrchestrator, SblProgress, SblReport, SblStep};
pub use security::{SecurityAccessEngine, SecurityVariant};
pub use transfer::{next_block_counter, BlockTransfer, DownloadSummary, EcuCapability};
pub use uds::{DiagnosticSession, NegativeResponseCode, RoutineResult, RoutineStatus, UdsService};
