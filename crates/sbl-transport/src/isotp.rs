//! ISO-TP endpoint over a [`CanBus`]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, trace, warn};

use crate::adapter::{IncomingMessage, TransportAdapter};
use crate::bus::CanBus;
use crate::error::{Result, TransportError};
use crate::flow_control::{FlowControlParams, FlowStatus, SeparationTime};
use crate::frame::{FrameType, IsoTpFrame, SignalId, TimestampedFrame};
use crate::segment::{segment, ReassemblyEvent, ReassemblyMode, ReassemblyState, Reassembler};
use crate::session::TransportSession;

fn default_flow_control_timeout_ms() -> u64 {
    1000
}

fn default_max_wait_frames() -> u32 {
    10
}

/// Addressing and timing of one ISO-TP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpConfig {
    /// Signal this endpoint transmits on
    pub tx_signal: SignalId,
    /// Signal this endpoint listens on
    pub rx_signal: SignalId,
    #[serde(default)]
    pub mode: ReassemblyMode,
    /// N_Bs / N_Cr: maximum gap waiting for flow control or the next consecutive frame
    #[serde(default = "default_flow_control_timeout_ms")]
    pub flow_control_timeout_ms: u64,
    /// Flow-control Wait frames accepted before giving up
    #[serde(default = "default_max_wait_frames")]
    pub max_wait_frames: u32,
}

impl IsoTpConfig {
    pub fn new(tx_signal: SignalId, rx_signal: SignalId) -> Self {
        Self {
            tx_signal,
            rx_signal,
            mode: ReassemblyMode::Strict,
            flow_control_timeout_ms: default_flow_control_timeout_ms(),
            max_wait_frames: default_max_wait_frames(),
        }
    }

    pub fn with_mode(mut self, mode: ReassemblyMode) -> Self {
        self.mode = mode;
        self
    }

    /// The same link seen from the other end
    pub fn reversed(&self) -> Self {
        Self {
            tx_signal: self.rx_signal.clone(),
            rx_signal: self.tx_signal.clone(),
            ..self.clone()
        }
    }

    fn flow_control_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_control_timeout_ms)
    }
}

/// Full-duplex ISO-TP endpoint.
///
/// Exchanges are serialized: one message is sent or received at a time.
pub struct IsoTpChannel {
    bus: Arc<dyn CanBus>,
    session: Arc<TransportSession>,
    config: IsoTpConfig,
    frames: Mutex<broadcast::Receiver<TimestampedFrame>>,
    exchange: Mutex<()>,
    incoming_tx: broadcast::Sender<IncomingMessage>,
}

impl IsoTpChannel {
    pub fn new(bus: Arc<dyn CanBus>, session: Arc<TransportSession>, config: IsoTpConfig) -> Self {
        let frames = bus.subscribe(&config.rx_signal);
        let (incoming_tx, _) = broadcast::channel(256);
        Self {
            bus,
            session,
            config,
            frames: Mutex::new(frames),
            exchange: Mutex::new(()),
            incoming_tx,
        }
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    /// Flow-control parameters advertised when this endpoint receives
    pub fn set_flow_control(&self, params: FlowControlParams) -> Result<()> {
        self.session.set_flow_control(&self.config.rx_signal, params)
    }

    /// Segment and transmit one payload, honoring the receiver's flow control
    pub async fn send_payload(&self, payload: &[u8]) -> Result<()> {
        let frames = segment(payload)?;
        let mut rx = self.frames.lock().await;

        let (first, consecutive) = frames
            .split_first()
            .ok_or_else(|| TransportError::SendFailed("segmenter produced no frames".to_string()))?;

        self.publish(first).await?;
        if consecutive.is_empty() {
            return Ok(());
        }

        debug!(
            signal = %self.config.tx_signal,
            length = payload.len(),
            frames = frames.len(),
            "Sending multi-frame message"
        );

        let mut remaining = consecutive.iter().peekable();
        while remaining.peek().is_some() {
            let (block_size, separation_time) = self.await_flow_control(&mut rx).await?;
            let mut sent_in_block = 0usize;

            while let Some(frame) = remaining.next() {
                self.publish(frame).await?;
                sent_in_block += 1;

                if remaining.peek().is_none() {
                    break;
                }
                if block_size > 0 && sent_in_block == block_size as usize {
                    break;
                }
                if separation_time > Duration::ZERO {
                    tokio::time::sleep(separation_time).await;
                }
            }
        }

        let popped = self.session.pop_flow_control_frames(&self.config.rx_signal);
        trace!(popped, "Consumed flow control frames released");
        Ok(())
    }

    /// Wait for one complete message, answering first frames with flow control
    pub async fn receive_payload(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut rx = self.frames.lock().await;
        self.receive_locked(&mut rx, timeout).await
    }

    async fn receive_locked(
        &self,
        rx: &mut broadcast::Receiver<TimestampedFrame>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let signal = &self.config.rx_signal;
        if let Some(message) = self.session.buffers(signal).lock().messages.pop_front() {
            return Ok(message);
        }

        let mut reassembler = Reassembler::new(self.config.mode);
        let mut deadline = TokioInstant::now() + timeout;

        loop {
            let frame = self.next_frame(rx, deadline).await?;
            self.session.record_frame(signal, frame.clone());

            if reassembler.state() != ReassemblyState::AwaitingConsecutive
                && frame.frame_type() == Some(FrameType::First)
            {
                let block_size = self.session.flow_control(signal).block_size;
                reassembler = Reassembler::new(self.config.mode).with_block_size(block_size);
            }

            match reassembler.push(&frame.data) {
                Ok(ReassemblyEvent::Complete(message)) => {
                    self.finish_message(message.clone());
                    return Ok(message);
                }
                Ok(ReassemblyEvent::FlowControlDue) => {
                    deadline = TokioInstant::now() + self.config.flow_control_timeout();
                    if !self.respond_flow_control().await? {
                        reassembler.clear();
                    }
                }
                Ok(ReassemblyEvent::Pending) => {
                    deadline = TokioInstant::now() + self.config.flow_control_timeout();
                }
                Ok(ReassemblyEvent::Skipped) => {}
                Err(err) => {
                    warn!(
                        signal = %signal,
                        frame = %hex::encode_upper(&frame.data),
                        error = %err,
                        "Reassembly failed"
                    );
                    self.session.clear(signal);
                    return Err(err);
                }
            }
        }
    }

    fn finish_message(&self, message: Vec<u8>) {
        let signal = &self.config.rx_signal;
        {
            let buffers = self.session.buffers(signal);
            let mut buffers = buffers.lock();
            buffers.frames.clear();
        }
        let _ = self.incoming_tx.send(IncomingMessage {
            timestamp: Instant::now(),
            data: message,
            source: signal.clone(),
        });
    }

    /// Send the configured flow control. Returns false when the message is refused.
    async fn respond_flow_control(&self) -> Result<bool> {
        let params = self.session.flow_control(&self.config.rx_signal);
        if !params.auto_respond {
            return Ok(true);
        }
        if params.response_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(params.response_delay_ms)).await;
        }

        match params.flow_status {
            FlowStatus::ContinueToSend => {
                self.publish(&params.to_frame()?).await?;
                Ok(true)
            }
            FlowStatus::Wait => {
                self.publish(&params.to_frame()?).await?;
                let resume = FlowControlParams {
                    flow_status: FlowStatus::ContinueToSend,
                    ..params
                };
                self.publish(&resume.to_frame()?).await?;
                Ok(true)
            }
            FlowStatus::Overflow => {
                warn!(signal = %self.config.rx_signal, "Refusing message with overflow flow control");
                self.publish(&params.to_frame()?).await?;
                Ok(false)
            }
        }
    }

    /// Block until a usable flow-control frame arrives.
    /// Returns the block size and separation time to honor.
    async fn await_flow_control(
        &self,
        rx: &mut broadcast::Receiver<TimestampedFrame>,
    ) -> Result<(u8, Duration)> {
        let mut waits = 0u32;
        let mut deadline = TokioInstant::now() + self.config.flow_control_timeout();

        loop {
            let frame = self.next_frame(rx, deadline).await.map_err(|err| match err {
                TransportError::Timeout(_) => TransportError::Timeout(format!(
                    "no flow control on {} within {} ms",
                    self.config.rx_signal, self.config.flow_control_timeout_ms
                )),
                other => other,
            })?;
            self.session.record_frame(&self.config.rx_signal, frame.clone());

            match IsoTpFrame::decode(&frame.data) {
                Ok(IsoTpFrame::FlowControl {
                    status: FlowStatus::ContinueToSend,
                    block_size,
                    separation_time,
                }) => {
                    let separation_time =
                        SeparationTime::from_byte(separation_time).unwrap_or_else(|_| {
                            warn!(
                                value = format!("0x{:02X}", separation_time),
                                "Reserved STmin, using 127 ms"
                            );
                            SeparationTime::MAX
                        });
                    return Ok((block_size, separation_time.duration()));
                }
                Ok(IsoTpFrame::FlowControl {
                    status: FlowStatus::Wait,
                    ..
                }) => {
                    waits += 1;
                    if waits > self.config.max_wait_frames {
                        return Err(TransportError::Timeout(format!(
                            "receiver sent {} wait frames",
                            waits
                        )));
                    }
                    deadline = TokioInstant::now() + self.config.flow_control_timeout();
                }
                Ok(IsoTpFrame::FlowControl {
                    status: FlowStatus::Overflow,
                    ..
                }) => return Err(TransportError::Overflow),
                decoded => {
                    let reason = "unexpected frame while awaiting flow control";
                    if self.config.mode == ReassemblyMode::Strict {
                        return Err(TransportError::sequence(reason, &frame.data));
                    }
                    match decoded {
                        // Keep early single-frame replies for the next receive
                        Ok(IsoTpFrame::Single { data }) => {
                            warn!(frame = %hex::encode_upper(&frame.data), "{}, queued", reason);
                            self.session.push_message(&self.config.rx_signal, data);
                        }
                        Ok(IsoTpFrame::First { length, .. }) => {
                            warn!(
                                frame = %hex::encode_upper(&frame.data),
                                declared_length = length,
                                "Dropped first frame received while awaiting flow control"
                            );
                        }
                        _ => warn!(frame = %hex::encode_upper(&frame.data), "{}", reason),
                    }
                }
            }
        }
    }

    async fn next_frame(
        &self,
        rx: &mut broadcast::Receiver<TimestampedFrame>,
        deadline: TokioInstant,
    ) -> Result<TimestampedFrame> {
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, signal = %self.config.rx_signal, "Receive buffer lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(TransportError::ConnectionClosed)
                }
                Err(_) => {
                    return Err(TransportError::Timeout(format!(
                        "no frame on {}",
                        self.config.rx_signal
                    )))
                }
            }
        }
    }

    async fn publish(&self, frame: &[u8]) -> Result<()> {
        self.bus.publish(&self.config.tx_signal, frame).await?;
        if let Some(frame_type) = frame.first().copied().and_then(FrameType::from_pci) {
            self.session
                .note_frame_sent(&self.config.tx_signal, frame_type);
        }
        Ok(())
    }

    /// Discard frames and messages left over from earlier exchanges
    fn drain_stale(&self, rx: &mut broadcast::Receiver<TimestampedFrame>) {
        let mut drained = 0usize;
        loop {
            match rx.try_recv() {
                Ok(_) => drained += 1,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => drained += skipped as usize,
                Err(_) => break,
            }
        }
        if drained > 0 {
            debug!(drained, signal = %self.config.rx_signal, "Drained stale frames");
        }
        self.session.clear(&self.config.rx_signal);
    }
}

#[async_trait]
impl TransportAdapter for IsoTpChannel {
    async fn send_receive(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let _exchange = self.exchange.lock().await;
        {
            let mut rx = self.frames.lock().await;
            self.drain_stale(&mut rx);
        }
        self.send_payload(request).await?;
        self.receive_payload(timeout).await
    }

    async fn send(&self, request: &[u8]) -> Result<()> {
        let _exchange = self.exchange.lock().await;
        self.send_payload(request).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        let _exchange = self.exchange.lock().await;
        self.receive_payload(timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }
}
