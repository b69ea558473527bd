//! Mock transport adapter for testing

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::adapter::{IncomingMessage, TransportAdapter};
use crate::error::{Result, TransportError};
use crate::frame::SignalId;

/// Mock transport adapter for testing
///
/// Responses are matched on exact request first, then on request prefix.
/// Unmatched requests get a bare positive response (`SID + 0x40`).
pub struct MockTransportAdapter {
    latency: Duration,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    responses: RwLock<Vec<(Vec<u8>, Vec<u8>)>>,
    /// Messages handed out by `receive`, e.g. the final answer after 0x78
    follow_ups: Mutex<VecDeque<Vec<u8>>>,
    requests: Mutex<Vec<Vec<u8>>>,
}

impl MockTransportAdapter {
    pub fn new() -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        Self {
            latency: Duration::ZERO,
            connected: AtomicBool::new(true),
            incoming_tx,
            responses: RwLock::new(Vec::new()),
            follow_ups: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add a mock response for a given request; later entries win
    pub fn add_response(&self, request: Vec<u8>, response: Vec<u8>) {
        self.responses.write().insert(0, (request, response));
    }

    /// Queue a message returned by the next `receive`
    pub fn push_follow_up(&self, response: Vec<u8>) {
        self.follow_ups.lock().push_back(response);
    }

    /// Every request sent so far, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }

    /// Requests whose first byte is `service_id`
    pub fn requests_for(&self, service_id: u8) -> Vec<Vec<u8>> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.first() == Some(&service_id))
            .cloned()
            .collect()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn find_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        let responses = self.responses.read();

        if let Some((_, resp)) = responses.iter().find(|(req, _)| req == request) {
            return Some(resp.clone());
        }
        if let Some((_, resp)) = responses.iter().find(|(req, _)| request.starts_with(req)) {
            return Some(resp.clone());
        }

        request.first().map(|sid| vec![sid.wrapping_add(0x40)])
    }

    async fn simulate_latency(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }

    fn deliver(&self, data: &[u8]) {
        let _ = self.incoming_tx.send(IncomingMessage {
            timestamp: Instant::now(),
            data: data.to_vec(),
            source: SignalId::new("mock", "mock"),
        });
    }
}

impl Default for MockTransportAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for MockTransportAdapter {
    async fn send_receive(&self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>> {
        self.simulate_latency().await?;
        self.requests.lock().push(request.to_vec());

        let response = self.find_response(request).ok_or_else(|| {
            TransportError::ReceiveFailed("No mock response configured".to_string())
        })?;
        self.deliver(&response);
        Ok(response)
    }

    async fn send(&self, request: &[u8]) -> Result<()> {
        self.simulate_latency().await?;
        tracing::debug!(request = %hex::encode_upper(request), "Mock transport: sent message");
        self.requests.lock().push(request.to_vec());
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.simulate_latency().await?;
        let next = self.follow_ups.lock().pop_front();
        match next {
            Some(response) => {
                self.deliver(&response);
                Ok(response)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout("no queued mock message".to_string()))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_then_prefix_match() {
        let mock = MockTransportAdapter::new();
        mock.add_response(vec![0x22], vec![0x7F, 0x22, 0x31]);
        mock.add_response(vec![0x22, 0xF1, 0x86], vec![0x62, 0xF1, 0x86, 0x01]);

        let timeout = Duration::from_millis(10);
        assert_eq!(
            mock.send_receive(&[0x22, 0xF1, 0x86], timeout).await.unwrap(),
            vec![0x62, 0xF1, 0x86, 0x01]
        );
        assert_eq!(
            mock.send_receive(&[0x22, 0xF1, 0x90], timeout).await.unwrap(),
            vec![0x7F, 0x22, 0x31]
        );
        assert_eq!(
            mock.send_receive(&[0x11, 0x01], timeout).await.unwrap(),
            vec![0x51]
        );
        assert_eq!(mock.requests_for(0x22).len(), 2);
    }

    #[tokio::test]
    async fn test_follow_up_queue() {
        let mock = MockTransportAdapter::new();
        mock.push_follow_up(vec![0x71, 0x01, 0xFF, 0x00, 0x10]);

        let timeout = Duration::from_millis(10);
        assert_eq!(
            mock.receive(timeout).await.unwrap(),
            vec![0x71, 0x01, 0xFF, 0x00, 0x10]
        );
        assert!(mock.receive(timeout).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnected() {
        let mock = MockTransportAdapter::new();
        mock.set_connected(false);
        assert_eq!(
            mock.send(&[0x3E, 0x80]).await,
            Err(TransportError::ConnectionClosed)
        );
    }
}
