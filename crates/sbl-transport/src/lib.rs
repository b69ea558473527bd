//! sbl-transport - ISO-TP style CAN transport for SBL flashing
//!
//! ```text
//!   TransportAdapter (whole UDS messages)
//!          │
//!     IsoTpChannel ── TransportSession (per-signal buffers, flow control)
//!          │
//!   segment / Reassembler / flow control frames
//!          │
//!       CanBus (VirtualBus, SocketCanBus)
//! ```

pub mod adapter;
pub mod bus;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod isotp;
pub mod mock;
pub mod periodic;
pub mod segment;
pub mod session;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{IncomingMessage, TransportAdapter};
pub use bus::{CanBus, VirtualBus};
pub use error::TransportError;
pub use flow_control::{generate_flow_control, FlowControlParams, FlowStatus, SeparationTime};
pub use frame::{FrameType, IsoTpFrame, SignalId, TimestampedFrame};
pub use isotp::{IsoTpChannel, IsoTpConfig};
pub use mock::MockTransportAdapter;
pub use periodic::{PeriodicCommand, PeriodicSender};
pub use segment::{
    reassemble, reassemble_with_mode, segment, ReassemblyEvent, ReassemblyMode, ReassemblyState,
    Reassembler,
};
pub use session::{SignalBuffers, TransportSession};
