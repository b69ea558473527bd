//! Raw SocketCAN bus (Linux only)
//!
//! Signals map to CAN identifiers; identifiers above 0x7FF are sent as
//! 29-bit extended frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ::socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId};
use tokio::sync::broadcast;
use tracing::{debug, error, trace};

use crate::bus::CanBus;
use crate::error::{Result, TransportError};
use crate::frame::{SignalId, TimestampedFrame};

pub struct SocketCanBus {
    socket: Arc<Mutex<CanSocket>>,
    ids: HashMap<SignalId, u32>,
    channels: Arc<HashMap<u32, broadcast::Sender<TimestampedFrame>>>,
    running: Arc<AtomicBool>,
}

impl SocketCanBus {
    pub fn open(interface: &str, routes: impl IntoIterator<Item = (SignalId, u32)>) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to open CAN interface {}: {}", interface, e))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        let ids: HashMap<SignalId, u32> = routes.into_iter().collect();
        let channels: HashMap<u32, broadcast::Sender<TimestampedFrame>> = ids
            .values()
            .map(|id| (*id, broadcast::channel(1024).0))
            .collect();

        let bus = Self {
            socket: Arc::new(Mutex::new(socket)),
            ids,
            channels: Arc::new(channels),
            running: Arc::new(AtomicBool::new(true)),
        };
        bus.start_listener();
        debug!(interface, signals = bus.ids.len(), "SocketCAN bus opened");
        Ok(bus)
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let channels = self.channels.clone();
        let running = self.running.clone();

        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(frame) => {
                        if let Some(tx) = channels.get(&frame.raw_id()) {
                            trace!(
                                can_id = format!("0x{:X}", frame.raw_id()),
                                data = %hex::encode_upper(frame.data()),
                                "Frame received"
                            );
                            let _ = tx.send(TimestampedFrame::now(frame.data().to_vec()));
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!("SocketCAN listener stopped");
        });
    }

    fn can_id(&self, signal: &SignalId) -> Result<u32> {
        self.ids
            .get(signal)
            .copied()
            .ok_or_else(|| TransportError::InvalidConfig(format!("No CAN id for signal {}", signal)))
    }
}

fn frame_id(raw: u32) -> Result<Id> {
    let id = if raw <= 0x7FF {
        StandardId::new(raw as u16).map(Id::Standard)
    } else {
        ExtendedId::new(raw).map(Id::Extended)
    };
    id.ok_or_else(|| TransportError::InvalidConfig(format!("Invalid CAN ID: 0x{:X}", raw)))
}

#[async_trait]
impl CanBus for SocketCanBus {
    fn subscribe(&self, signal: &SignalId) -> broadcast::Receiver<TimestampedFrame> {
        match self.ids.get(signal).and_then(|id| self.channels.get(id)) {
            Some(tx) => tx.subscribe(),
            None => {
                error!(%signal, "Subscribing to a signal without CAN id");
                broadcast::channel(1).1
            }
        }
    }

    async fn publish(&self, signal: &SignalId, data: &[u8]) -> Result<()> {
        let id = frame_id(self.can_id(signal)?)?;
        let frame = CanFrame::new(id, data)
            .ok_or_else(|| TransportError::InvalidFrame(format!("{} bytes", data.len())))?;
        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || socket.lock().write_frame(&frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
