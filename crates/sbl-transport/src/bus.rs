//! CAN bus collaborator: subscribe/publish keyed by signal

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{Result, TransportError};
use crate::frame::{SignalId, TimestampedFrame, CAN_FRAME_LEN};

/// Raw frame bus.
///
/// Implementations deliver every frame published on a signal to all current
/// subscribers of that signal, in publish order.
#[async_trait]
pub trait CanBus: Send + Sync {
    fn subscribe(&self, signal: &SignalId) -> broadcast::Receiver<TimestampedFrame>;

    async fn publish(&self, signal: &SignalId, data: &[u8]) -> Result<()>;
}

/// In-memory bus used by the simulator and tests
pub struct VirtualBus {
    channels: RwLock<HashMap<SignalId, broadcast::Sender<TimestampedFrame>>>,
    capacity: usize,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, signal: &SignalId) -> broadcast::Sender<TimestampedFrame> {
        if let Some(tx) = self.channels.read().get(signal) {
            return tx.clone();
        }
        self.channels
            .write()
            .entry(signal.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CanBus for VirtualBus {
    fn subscribe(&self, signal: &SignalId) -> broadcast::Receiver<TimestampedFrame> {
        self.sender(signal).subscribe()
    }

    async fn publish(&self, signal: &SignalId, data: &[u8]) -> Result<()> {
        if data.len() > CAN_FRAME_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "{} bytes exceed a classic CAN frame",
                data.len()
            )));
        }

        tracing::trace!(%signal, data = %hex::encode_upper(data), "Publish");
        if self
            .sender(signal)
            .send(TimestampedFrame::now(data.to_vec()))
            .is_err()
        {
            // No subscribers on this signal
            tracing::trace!(%signal, "Frame dropped, no subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = VirtualBus::new();
        let signal = SignalId::new("Req", "Diag");
        let mut rx1 = bus.subscribe(&signal);
        let mut rx2 = bus.subscribe(&signal);

        bus.publish(&signal, &[0x02, 0x10, 0x02]).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().data, vec![0x02, 0x10, 0x02]);
        assert_eq!(rx2.recv().await.unwrap().data, vec![0x02, 0x10, 0x02]);
    }

    #[tokio::test]
    async fn test_signals_are_isolated() {
        let bus = VirtualBus::new();
        let req = SignalId::new("Req", "Diag");
        let resp = SignalId::new("Resp", "Diag");
        let mut rx = bus.subscribe(&resp);

        bus.publish(&req, &[0x01]).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let bus = VirtualBus::new();
        let signal = SignalId::new("Req", "Diag");
        assert!(bus.publish(&signal, &[0u8; 9]).await.is_err());
    }
}
