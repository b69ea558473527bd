//! Transport adapter trait and types

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::frame::SignalId;

/// Complete message received from the transport
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Timestamp when the message was completed
    pub timestamp: Instant,
    /// Raw UDS payload data
    pub data: Vec<u8>,
    /// Signal the message arrived on
    pub source: SignalId,
}

/// Transport-agnostic interface for UDS communication
///
/// Implementations carry whole UDS messages; segmentation and flow control
/// happen underneath.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Send a UDS request and wait for a response
    async fn send_receive(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    /// Send a UDS request without waiting for a response
    async fn send(&self, request: &[u8]) -> Result<()>;

    /// Wait for the next message without sending anything.
    ///
    /// Used after a response-pending NRC, where the final answer follows
    /// without a new request.
    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>>;

    /// Subscribe to every message the transport receives
    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage>;
}
