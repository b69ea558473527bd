//! CAN frame model and ISO-TP protocol control information (PCI) codec

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::flow_control::FlowStatus;

/// Classic CAN payload length
pub const CAN_FRAME_LEN: usize = 8;
/// Largest payload carried by a single frame
pub const SINGLE_FRAME_MAX: usize = 7;
/// Payload bytes carried by a first frame
pub const FIRST_FRAME_DATA: usize = 6;
/// Payload bytes carried by a consecutive frame
pub const CONSECUTIVE_FRAME_DATA: usize = 7;
/// Largest payload expressible with the 12-bit first-frame length
pub const MAX_PAYLOAD_LEN: usize = 4095;
/// Fill byte for unused frame bytes
pub const PADDING_BYTE: u8 = 0x00;

/// Frame type, encoded in the high nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Single,
    First,
    Consecutive,
    FlowControl,
}

impl FrameType {
    pub fn from_pci(byte0: u8) -> Option<Self> {
        match byte0 >> 4 {
            0x0 => Some(Self::Single),
            0x1 => Some(Self::First),
            0x2 => Some(Self::Consecutive),
            0x3 => Some(Self::FlowControl),
            _ => None,
        }
    }

    pub fn nibble(self) -> u8 {
        match self {
            Self::Single => 0x0,
            Self::First => 0x1,
            Self::Consecutive => 0x2,
            Self::FlowControl => 0x3,
        }
    }
}

/// Logical signal a frame travels on, as exposed by the bus bridge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalId {
    pub name: String,
    pub namespace: String,
}

impl SignalId {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Raw frame as delivered by the bus
#[derive(Debug, Clone)]
pub struct TimestampedFrame {
    pub timestamp: Instant,
    pub data: Vec<u8>,
}

impl TimestampedFrame {
    pub fn now(data: Vec<u8>) -> Self {
        Self {
            timestamp: Instant::now(),
            data,
        }
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        self.data.first().copied().and_then(FrameType::from_pci)
    }
}

/// Decoded ISO-TP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    Single {
        data: Vec<u8>,
    },
    First {
        length: u16,
        data: Vec<u8>,
    },
    Consecutive {
        sequence: u8,
        data: Vec<u8>,
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        separation_time: u8,
    },
}

impl IsoTpFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Single { .. } => FrameType::Single,
            Self::First { .. } => FrameType::First,
            Self::Consecutive { .. } => FrameType::Consecutive,
            Self::FlowControl { .. } => FrameType::FlowControl,
        }
    }

    /// Decode one raw CAN payload.
    ///
    /// Consecutive frames carry up to 7 bytes; the caller trims the last one
    /// against the length announced by the first frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let byte0 = *frame
            .first()
            .ok_or_else(|| TransportError::InvalidFrame("empty frame".to_string()))?;

        let frame_type = FrameType::from_pci(byte0).ok_or_else(|| {
            TransportError::InvalidFrame(format!(
                "unknown frame type 0x{:X} in {}",
                byte0 >> 4,
                hex::encode_upper(frame)
            ))
        })?;

        match frame_type {
            FrameType::Single => {
                let length = (byte0 & 0x0F) as usize;
                if length > SINGLE_FRAME_MAX || frame.len() < 1 + length {
                    return Err(TransportError::InvalidFrame(format!(
                        "single frame length {} invalid for {}",
                        length,
                        hex::encode_upper(frame)
                    )));
                }
                Ok(Self::Single {
                    data: frame[1..1 + length].to_vec(),
                })
            }
            FrameType::First => {
                if frame.len() < 2 {
                    return Err(TransportError::InvalidFrame(format!(
                        "truncated first frame {}",
                        hex::encode_upper(frame)
                    )));
                }
                let length = (((byte0 & 0x0F) as u16) << 8) | frame[1] as u16;
                if (length as usize) <= SINGLE_FRAME_MAX {
                    return Err(TransportError::InvalidFrame(format!(
                        "first frame announces {} bytes, which fits a single frame",
                        length
                    )));
                }
                let end = frame.len().min(2 + FIRST_FRAME_DATA);
                Ok(Self::First {
                    length,
                    data: frame[2..end].to_vec(),
                })
            }
            FrameType::Consecutive => {
                let end = frame.len().min(1 + CONSECUTIVE_FRAME_DATA);
                Ok(Self::Consecutive {
                    sequence: byte0 & 0x0F,
                    data: frame[1..end].to_vec(),
                })
            }
            FrameType::FlowControl => {
                if frame.len() < 3 {
                    return Err(TransportError::InvalidFlowControl(format!(
                        "truncated flow control frame {}",
                        hex::encode_upper(frame)
                    )));
                }
                Ok(Self::FlowControl {
                    status: FlowStatus::try_from(byte0 & 0x0F)?,
                    block_size: frame[1],
                    separation_time: frame[2],
                })
            }
        }
    }

    /// Encode into a padded 8-byte CAN payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CAN_FRAME_LEN);
        match self {
            Self::Single { data } => {
                out.push(data.len() as u8 & 0x0F);
                out.extend_from_slice(data);
            }
            Self::First { length, data } => {
                out.push(0x10 | ((length >> 8) as u8 & 0x0F));
                out.push(*length as u8);
                out.extend_from_slice(data);
            }
            Self::Consecutive { sequence, data } => {
                out.push(0x20 | (sequence & 0x0F));
                out.extend_from_slice(data);
            }
            Self::FlowControl {
                status,
                block_size,
                separation_time,
            } => {
                out.push(0x30 | status.as_u8());
                out.push(*block_size);
                out.push(*separation_time);
            }
        }
        out.resize(CAN_FRAME_LEN, PADDING_BYTE);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_pci() {
        assert_eq!(FrameType::from_pci(0x03), Some(FrameType::Single));
        assert_eq!(FrameType::from_pci(0x10), Some(FrameType::First));
        assert_eq!(FrameType::from_pci(0x2F), Some(FrameType::Consecutive));
        assert_eq!(FrameType::from_pci(0x30), Some(FrameType::FlowControl));
        assert_eq!(FrameType::from_pci(0x40), None);
    }

    #[test]
    fn test_decode_first_frame() {
        let frame = [0x10, 0x14, 0x36, 0x01, 0xAA, 0xBB, 0xCC, 0xDD];
        let decoded = IsoTpFrame::decode(&frame).unwrap();
        assert_eq!(
            decoded,
            IsoTpFrame::First {
                length: 20,
                data: vec![0x36, 0x01, 0xAA, 0xBB, 0xCC, 0xDD],
            }
        );
    }

    #[test]
    fn test_decode_flow_control() {
        let decoded = IsoTpFrame::decode(&[0x30, 0x08, 0x14, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(
            decoded,
            IsoTpFrame::FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size: 8,
                separation_time: 20,
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(IsoTpFrame::decode(&[]).is_err());
        assert!(IsoTpFrame::decode(&[0x08, 1, 2, 3, 4, 5, 6, 7]).is_err());
        assert!(IsoTpFrame::decode(&[0x10, 0x05, 1, 2, 3, 4, 5, 0]).is_err());
        assert!(IsoTpFrame::decode(&[0x33, 0x00, 0x00]).is_err());
        assert!(IsoTpFrame::decode(&[0x50, 0x00]).is_err());
    }

    #[test]
    fn test_encode_pads_to_eight_bytes() {
        let frame = IsoTpFrame::Consecutive {
            sequence: 0x11,
            data: vec![0xAB, 0xCD],
        };
        assert_eq!(frame.encode(), vec![0x21, 0xAB, 0xCD, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_signal_id_display() {
        let signal = SignalId::new("Vcu1ToEcuFront1DiagReqFrame", "Front1CANCfg0");
        assert_eq!(
            signal.to_string(),
            "Front1CANCfg0/Vcu1ToEcuFront1DiagReqFrame"
        );
    }
}
