//! Flow-control frames and per-signal send parameters

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::frame::{IsoTpFrame, CAN_FRAME_LEN};

/// Flow status carried in the low nibble of a flow-control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::ContinueToSend => 0,
            Self::Wait => 1,
            Self::Overflow => 2,
        }
    }
}

impl TryFrom<u8> for FlowStatus {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::ContinueToSend),
            1 => Ok(Self::Wait),
            2 => Ok(Self::Overflow),
            other => Err(TransportError::InvalidFlowControl(format!(
                "flow status {} not in {{0, 1, 2}}",
                other
            ))),
        }
    }
}

/// STmin: 0x00-0x7F milliseconds, 0xF1-0xF9 = 100-900 microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeparationTime(u8);

impl SeparationTime {
    pub const ZERO: Self = Self(0);
    /// Used when a peer sends a reserved STmin value
    pub const MAX: Self = Self(0x7F);

    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            0x00..=0x7F | 0xF1..=0xF9 => Ok(Self(value)),
            other => Err(TransportError::InvalidFlowControl(format!(
                "separation time 0x{:02X} outside 0x00-0x7F and 0xF1-0xF9",
                other
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn duration(self) -> Duration {
        match self.0 {
            0xF1..=0xF9 => Duration::from_micros((self.0 - 0xF0) as u64 * 100),
            ms => Duration::from_millis(ms as u64),
        }
    }
}

/// Build a flow-control frame, validating every field.
///
/// `block_size` is taken wider than a byte so out-of-range values from callers
/// and configuration are rejected instead of truncated.
pub fn generate_flow_control(
    flow_status: u8,
    block_size: u16,
    separation_time: u8,
) -> Result<[u8; CAN_FRAME_LEN]> {
    let status = FlowStatus::try_from(flow_status)?;
    let block_size = u8::try_from(block_size).map_err(|_| {
        TransportError::InvalidFlowControl(format!("block size {} exceeds 255", block_size))
    })?;
    let separation_time = SeparationTime::from_byte(separation_time)?;

    let encoded = IsoTpFrame::FlowControl {
        status,
        block_size,
        separation_time: separation_time.as_byte(),
    }
    .encode();

    let mut frame = [0u8; CAN_FRAME_LEN];
    frame.copy_from_slice(&encoded);
    Ok(frame)
}

fn default_auto_respond() -> bool {
    true
}

/// Flow-control parameters a receiver advertises for one signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlParams {
    /// Consecutive frames between flow-control frames, 0 = unlimited
    #[serde(default)]
    pub block_size: u8,
    /// Raw STmin byte
    #[serde(default)]
    pub separation_time: u8,
    #[serde(default)]
    pub flow_status: FlowStatus,
    /// Answer first frames automatically
    #[serde(default = "default_auto_respond")]
    pub auto_respond: bool,
    /// Delay before the flow-control frame goes out
    #[serde(default)]
    pub response_delay_ms: u64,
}

impl Default for FlowControlParams {
    fn default() -> Self {
        Self {
            block_size: 0,
            separation_time: 0,
            flow_status: FlowStatus::ContinueToSend,
            auto_respond: true,
            response_delay_ms: 0,
        }
    }
}

impl FlowControlParams {
    pub fn validate(&self) -> Result<()> {
        SeparationTime::from_byte(self.separation_time).map(|_| ())
    }

    pub fn to_frame(&self) -> Result<[u8; CAN_FRAME_LEN]> {
        generate_flow_control(
            self.flow_status.as_u8(),
            self.block_size as u16,
            self.separation_time,
        )
    }
}
