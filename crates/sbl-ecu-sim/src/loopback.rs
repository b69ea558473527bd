//! In-process transport straight into a [`SimulatedEcu`]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sbl_transport::{IncomingMessage, SignalId, TransportAdapter, TransportError};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ecu::SimulatedEcu;

type Result<T> = std::result::Result<T, TransportError>;

/// Carries whole UDS messages to the ECU without any framing.
///
/// The first response to a request is returned by `send_receive`; any
/// further ones (the final answer after a response-pending NRC) queue up
/// for `receive`.
pub struct LoopbackTransport {
    ecu: Arc<SimulatedEcu>,
    follow_ups: Mutex<VecDeque<Vec<u8>>>,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    source: SignalId,
}

impl LoopbackTransport {
    pub fn new(ecu: Arc<SimulatedEcu>) -> Self {
        let (incoming_tx, _) = broadcast::channel(256);
        Self {
            ecu,
            follow_ups: Mutex::new(VecDeque::new()),
            incoming_tx,
            source: SignalId::new("EcuResp", "Loopback"),
        }
    }

    pub fn ecu(&self) -> &Arc<SimulatedEcu> {
        &self.ecu
    }

    fn deliver(&self, data: &[u8]) {
        let _ = self.incoming_tx.send(IncomingMessage {
            timestamp: Instant::now(),
            data: data.to_vec(),
            source: self.source.clone(),
        });
    }

    /// Run `request` and queue every response
    fn dispatch(&self, request: &[u8]) {
        trace!(request = %hex::encode_upper(request), "Loopback request");
        let responses = self.ecu.handle(request);
        let mut follow_ups = self.follow_ups.lock();
        follow_ups.clear();
        follow_ups.extend(responses);
    }

    async fn next_response(&self, timeout: Duration) -> Result<Vec<u8>> {
        let next = self.follow_ups.lock().pop_front();
        match next {
            Some(response) => {
                self.deliver(&response);
                Ok(response)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(
                    "no response from simulated ECU".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    async fn send_receive(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.dispatch(request);
        self.next_response(timeout).await
    }

    async fn send(&self, request: &[u8]) -> Result<()> {
        self.dispatch(request);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.next_response(timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcuConfig;
    use pretty_assertions::assert_eq;
    use sbl_security::DelayTimerConfig;

    fn transport(config: EcuConfig) -> LoopbackTransport {
        LoopbackTransport::new(Arc::new(SimulatedEcu::new(&config).unwrap()))
    }

    #[tokio::test]
    async fn test_request_response() {
        let transport = transport(EcuConfig::default());
        let mut incoming = transport.subscribe();

        let response = transport
            .send_receive(&[0x22, 0xF1, 0x86], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response, vec![0x62, 0xF1, 0x86, 0x01]);
        assert_eq!(incoming.recv().await.unwrap().data, response);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_response_times_out() {
        let transport = transport(EcuConfig::default());
        let result = transport
            .send_receive(&[0x3E, 0x80], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_pending_then_final() {
        let mut config = EcuConfig::default();
        config.security.delay_timer = DelayTimerConfig::relaxed();
        config.programming.erase_pending_responses = 1;
        let transport = transport(config);
        let ecu = transport.ecu().clone();
        let timeout = Duration::from_millis(100);

        ecu.set_fixed_seed(Some([0x1A, 0x2B, 0x3C]));
        transport.send_receive(&[0x10, 0x02], timeout).await.unwrap();
        transport.send_receive(&[0x27, 0x01], timeout).await.unwrap();
        transport
            .send_receive(&[0x27, 0x02, 0x97, 0xFB, 0xDF], timeout)
            .await
            .unwrap();
        let sbl = [0xA5u8; 8];
        transport
            .send_receive(&[0x34, 0x00, 0x44, 0x20, 0, 0, 0, 0, 0, 0, 8], timeout)
            .await
            .unwrap();
        transport
            .send_receive(&[&[0x36, 0x01][..], &sbl].concat(), timeout)
            .await
            .unwrap();
        transport.send_receive(&[0x37], timeout).await.unwrap();
        transport
            .send_receive(&[0x31, 0x01, 0x03, 0x01, 0x20, 0, 0, 0], timeout)
            .await
            .unwrap();

        let erase = [0x31, 0x01, 0xFF, 0x00, 0x44, 0, 0x08, 0, 0, 0, 0, 0x10, 0];
        assert_eq!(
            transport.send_receive(&erase, timeout).await.unwrap(),
            vec![0x7F, 0x31, 0x78]
        );
        assert_eq!(
            transport.receive(timeout).await.unwrap(),
            vec![0x71, 0x01, 0xFF, 0x00, 0x10, 0x00]
        );
    }
}
