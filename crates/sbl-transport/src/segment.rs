//! Payload segmentation and reassembly
//!
//! ```text
//!  Idle ──first frame──▶ AwaitingConsecutive ──final CF──▶ Complete
//!   ▲                          │                             │
//!   └──────── error ◀──────────┘                             │
//!   └──────────────────────── clear ◀────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::frame::{
    IsoTpFrame, CONSECUTIVE_FRAME_DATA, FIRST_FRAME_DATA, MAX_PAYLOAD_LEN, SINGLE_FRAME_MAX,
};

/// Split a payload into CAN frames.
///
/// Payloads up to 7 bytes become one single frame; longer payloads become a
/// first frame followed by consecutive frames with a 4-bit counter starting at 1.
pub fn segment(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(TransportError::PayloadTooLarge(payload.len()));
    }

    if payload.len() <= SINGLE_FRAME_MAX {
        let frame = IsoTpFrame::Single {
            data: payload.to_vec(),
        };
        return Ok(vec![frame.encode()]);
    }

    let remaining = payload.len() - FIRST_FRAME_DATA;
    let mut frames = Vec::with_capacity(1 + remaining.div_ceil(CONSECUTIVE_FRAME_DATA));
    frames.push(
        IsoTpFrame::First {
            length: payload.len() as u16,
            data: payload[..FIRST_FRAME_DATA].to_vec(),
        }
        .encode(),
    );

    for (index, chunk) in payload[FIRST_FRAME_DATA..]
        .chunks(CONSECUTIVE_FRAME_DATA)
        .enumerate()
    {
        frames.push(
            IsoTpFrame::Consecutive {
                sequence: ((index + 1) & 0x0F) as u8,
                data: chunk.to_vec(),
            }
            .encode(),
        );
    }

    Ok(frames)
}

/// Reassemble a captured frame sequence into one payload.
///
/// Flow-control frames interleaved in the capture are skipped.
pub fn reassemble(frames: &[Vec<u8>]) -> Result<Vec<u8>> {
    reassemble_with_mode(frames, ReassemblyMode::Strict)
}

pub fn reassemble_with_mode(frames: &[Vec<u8>], mode: ReassemblyMode) -> Result<Vec<u8>> {
    let mut reassembler = Reassembler::new(mode);
    for frame in frames {
        if let ReassemblyEvent::Complete(payload) = reassembler.push(frame)? {
            return Ok(payload);
        }
    }
    Err(TransportError::ReceiveFailed(format!(
        "incomplete message after {} frames ({} of {} bytes)",
        frames.len(),
        reassembler.buffer.len(),
        reassembler.expected_len
    )))
}

/// How the reassembler treats sequence anomalies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyMode {
    /// Any anomaly fails the exchange
    #[default]
    Strict,
    /// Anomalies are logged and the frame is accepted
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Idle,
    AwaitingConsecutive,
    Complete,
}

/// Outcome of pushing one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// More consecutive frames are expected
    Pending,
    /// The sender is waiting for a flow-control frame (after a first frame or a full block)
    FlowControlDue,
    /// The message is complete
    Complete(Vec<u8>),
    /// The frame is not part of a receive sequence
    Skipped,
}

/// Receive-side state machine for one signal
#[derive(Debug)]
pub struct Reassembler {
    mode: ReassemblyMode,
    block_size: u8,
    state: ReassemblyState,
    buffer: Vec<u8>,
    expected_len: usize,
    next_sequence: u8,
    frames_in_block: u8,
}

impl Reassembler {
    pub fn new(mode: ReassemblyMode) -> Self {
        Self {
            mode,
            block_size: 0,
            state: ReassemblyState::Idle,
            buffer: Vec::new(),
            expected_len: 0,
            next_sequence: 1,
            frames_in_block: 0,
        }
    }

    /// Block size advertised to the sender; a new flow control is due after that many CFs
    pub fn with_block_size(mut self, block_size: u8) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    pub fn mode(&self) -> ReassemblyMode {
        self.mode
    }

    /// Drop any partial message and return to `Idle`
    pub fn clear(&mut self) {
        self.state = ReassemblyState::Idle;
        self.buffer.clear();
        self.expected_len = 0;
        self.next_sequence = 1;
        self.frames_in_block = 0;
    }

    pub fn push(&mut self, raw: &[u8]) -> Result<ReassemblyEvent> {
        let frame = IsoTpFrame::decode(raw)?;

        if self.state == ReassemblyState::Complete {
            self.clear();
        }

        match (self.state, frame) {
            (ReassemblyState::Idle, IsoTpFrame::FlowControl { .. }) => {
                debug!(frame = %hex::encode_upper(raw), "Flow control outside a receive sequence");
                Ok(ReassemblyEvent::Skipped)
            }
            (ReassemblyState::AwaitingConsecutive, IsoTpFrame::FlowControl { .. }) => {
                self.anomaly("unsolicited flow control while awaiting consecutive frames", raw)?;
                Ok(ReassemblyEvent::Skipped)
            }
            (ReassemblyState::Idle, IsoTpFrame::Consecutive { .. }) => {
                self.anomaly("consecutive frame without first frame", raw)?;
                Ok(ReassemblyEvent::Skipped)
            }
            (ReassemblyState::AwaitingConsecutive, IsoTpFrame::Consecutive { sequence, data }) => {
                if sequence != self.next_sequence {
                    let reason = format!(
                        "consecutive frame counter 0x{:X}, expected 0x{:X}",
                        sequence, self.next_sequence
                    );
                    if let Err(err) = self.anomaly(&reason, raw) {
                        self.clear();
                        return Err(err);
                    }
                }
                Ok(self.accept_consecutive(sequence, &data))
            }
            (state, IsoTpFrame::Single { data }) => {
                if state == ReassemblyState::AwaitingConsecutive {
                    self.interrupted(raw)?;
                }
                self.state = ReassemblyState::Complete;
                Ok(ReassemblyEvent::Complete(data))
            }
            (state, IsoTpFrame::First { length, data }) => {
                if state == ReassemblyState::AwaitingConsecutive {
                    self.interrupted(raw)?;
                }
                self.start(length as usize, data);
                Ok(ReassemblyEvent::FlowControlDue)
            }
            (ReassemblyState::Complete, _) => Ok(ReassemblyEvent::Skipped),
        }
    }

    fn start(&mut self, length: usize, data: Vec<u8>) {
        self.clear();
        self.expected_len = length;
        self.buffer = data;
        self.buffer.reserve(length.saturating_sub(FIRST_FRAME_DATA));
        self.state = ReassemblyState::AwaitingConsecutive;
    }

    fn accept_consecutive(&mut self, sequence: u8, data: &[u8]) -> ReassemblyEvent {
        let take = (self.expected_len - self.buffer.len()).min(data.len());
        self.buffer.extend_from_slice(&data[..take]);
        self.next_sequence = (sequence + 1) & 0x0F;
        self.frames_in_block = self.frames_in_block.wrapping_add(1);

        if self.buffer.len() >= self.expected_len {
            self.state = ReassemblyState::Complete;
            return ReassemblyEvent::Complete(std::mem::take(&mut self.buffer));
        }

        if self.block_size > 0 && self.frames_in_block == self.block_size {
            self.frames_in_block = 0;
            return ReassemblyEvent::FlowControlDue;
        }

        ReassemblyEvent::Pending
    }

    /// A new single or first frame arrived mid-message
    fn interrupted(&mut self, raw: &[u8]) -> Result<()> {
        let reason = format!(
            "new message started after {} of {} bytes",
            self.buffer.len(),
            self.expected_len
        );
        let result = self.anomaly(&reason, raw);
        self.clear();
        result
    }

    fn anomaly(&self, reason: &str, raw: &[u8]) -> Result<()> {
        match self.mode {
            ReassemblyMode::Strict => Err(TransportError::sequence(reason, raw)),
            ReassemblyMode::Lenient => {
                warn!(frame = %hex::encode_upper(raw), "{}", reason);
                Ok(())
            }
        }
    }
}
