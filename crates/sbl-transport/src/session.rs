//! Per-signal frame buffers and flow-control tables
//!
//! Each signal has its own lock; nothing locks across signals.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::flow_control::FlowControlParams;
use crate::frame::{FrameType, SignalId, TimestampedFrame};

/// Buffers owned by one signal
#[derive(Debug, Default)]
pub struct SignalBuffers {
    /// Raw frames received on this signal, oldest first
    pub frames: VecDeque<TimestampedFrame>,
    /// Reassembled messages not yet consumed
    pub messages: VecDeque<Vec<u8>>,
    /// Frames sent since the last first frame
    pub frames_sent: usize,
    /// Parameters advertised when this signal receives a first frame
    pub flow_control: FlowControlParams,
}

/// Transport state shared by the channels of one diagnostic session
#[derive(Debug, Default)]
pub struct TransportSession {
    signals: RwLock<HashMap<SignalId, Arc<Mutex<SignalBuffers>>>>,
}

impl TransportSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers for a signal, created on first use
    pub fn buffers(&self, signal: &SignalId) -> Arc<Mutex<SignalBuffers>> {
        if let Some(buffers) = self.signals.read().get(signal) {
            return buffers.clone();
        }
        self.signals
            .write()
            .entry(signal.clone())
            .or_default()
            .clone()
    }

    pub fn record_frame(&self, signal: &SignalId, frame: TimestampedFrame) {
        self.buffers(signal).lock().frames.push_back(frame);
    }

    pub fn push_message(&self, signal: &SignalId, message: Vec<u8>) {
        self.buffers(signal).lock().messages.push_back(message);
    }

    pub fn take_messages(&self, signal: &SignalId) -> Vec<Vec<u8>> {
        self.buffers(signal).lock().messages.drain(..).collect()
    }

    /// Snapshot of the frames received so far
    pub fn frames(&self, signal: &SignalId) -> Vec<TimestampedFrame> {
        self.buffers(signal).lock().frames.iter().cloned().collect()
    }

    /// Clear frames and messages of one signal; flow-control settings are kept
    pub fn clear(&self, signal: &SignalId) {
        let buffers = self.buffers(signal);
        let mut buffers = buffers.lock();
        buffers.frames.clear();
        buffers.messages.clear();
    }

    pub fn clear_all(&self) {
        for buffers in self.signals.read().values() {
            let mut buffers = buffers.lock();
            buffers.frames.clear();
            buffers.messages.clear();
            buffers.frames_sent = 0;
        }
    }

    pub fn flow_control(&self, signal: &SignalId) -> FlowControlParams {
        self.buffers(signal).lock().flow_control.clone()
    }

    pub fn set_flow_control(&self, signal: &SignalId, params: FlowControlParams) -> Result<()> {
        params.validate()?;
        self.buffers(signal).lock().flow_control = params;
        Ok(())
    }

    /// Count a transmitted frame; a first frame restarts the count
    pub fn note_frame_sent(&self, signal: &SignalId, frame_type: FrameType) -> usize {
        let buffers = self.buffers(signal);
        let mut buffers = buffers.lock();
        if frame_type == FrameType::First {
            buffers.frames_sent = 0;
        }
        buffers.frames_sent += 1;
        buffers.frames_sent
    }

    pub fn frames_sent(&self, signal: &SignalId) -> usize {
        self.buffers(signal).lock().frames_sent
    }

    /// Remove flow-control frames consumed by a finished multi-frame send
    pub fn pop_flow_control_frames(&self, signal: &SignalId) -> usize {
        let buffers = self.buffers(signal);
        let mut buffers = buffers.lock();
        let before = buffers.frames.len();
        buffers
            .frames
            .retain(|frame| frame.frame_type() != Some(FrameType::FlowControl));
        before - buffers.frames.len()
    }
}
