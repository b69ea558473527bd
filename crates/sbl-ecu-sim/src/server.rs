//! Serves a [`SimulatedEcu`] over ISO-TP on a CAN bus
//!
//! Physical requests arrive on the ECU's ISO-TP channel. A second task
//! listens for single-frame functional requests and answers TesterPresent
//! on the physical response signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sbl_transport::{CanBus, IsoTpChannel, IsoTpConfig, SignalId, TransportError, TransportSession};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ecu::SimulatedEcu;
use crate::uds::service_id;

/// How often the loops check for shutdown while idle
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct EcuServer {
    ecu: Arc<SimulatedEcu>,
    bus: Arc<dyn CanBus>,
    channel: Arc<IsoTpChannel>,
    functional: Option<SignalId>,
}

impl EcuServer {
    /// `config` is seen from the ECU: it receives on `rx_signal` and
    /// answers on `tx_signal`
    pub fn new(ecu: Arc<SimulatedEcu>, bus: Arc<dyn CanBus>, config: IsoTpConfig) -> Self {
        let channel = IsoTpChannel::new(bus.clone(), Arc::new(TransportSession::new()), config);
        Self {
            ecu,
            bus,
            channel: Arc::new(channel),
            functional: None,
        }
    }

    /// Also answer functional TesterPresent requests sent on `signal`
    pub fn with_functional(mut self, signal: SignalId) -> Self {
        self.functional = Some(signal);
        self
    }

    pub fn ecu(&self) -> &Arc<SimulatedEcu> {
        &self.ecu
    }

    pub fn channel(&self) -> &Arc<IsoTpChannel> {
        &self.channel
    }

    pub fn spawn(self) -> EcuServerHandle {
        let running = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::new();

        info!(
            rx = %self.channel.config().rx_signal,
            tx = %self.channel.config().tx_signal,
            "ECU server started"
        );

        tasks.push(tokio::spawn(physical_loop(
            self.ecu.clone(),
            self.channel.clone(),
            running.clone(),
        )));

        if let Some(signal) = self.functional {
            tasks.push(tokio::spawn(functional_loop(
                self.ecu,
                self.bus,
                self.channel,
                signal,
                running.clone(),
            )));
        }

        EcuServerHandle { running, tasks }
    }
}

pub struct EcuServerHandle {
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EcuServerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
        info!("ECU server stopped");
    }
}

async fn physical_loop(ecu: Arc<SimulatedEcu>, channel: Arc<IsoTpChannel>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let request = match channel.receive_payload(POLL_INTERVAL).await {
            Ok(request) => request,
            Err(TransportError::Timeout(_)) => continue,
            Err(e) => {
                warn!(error = %e, "Failed to receive request");
                continue;
            }
        };

        debug!(request = %hex::encode_upper(&request), "Received UDS request");
        for response in ecu.handle(&request) {
            debug!(response = %hex::encode_upper(&response), "Sending UDS response");
            if let Err(e) = channel.send_payload(&response).await {
                error!(error = %e, "Failed to send response");
                break;
            }
        }
    }
}

async fn functional_loop(
    ecu: Arc<SimulatedEcu>,
    bus: Arc<dyn CanBus>,
    channel: Arc<IsoTpChannel>,
    signal: SignalId,
    running: Arc<AtomicBool>,
) {
    let mut frames = bus.subscribe(&signal);
    info!(%signal, "Functional listener started");

    while running.load(Ordering::SeqCst) {
        let frame = match tokio::time::timeout(POLL_INTERVAL, frames.recv()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Functional listener lagged");
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => continue,
        };

        let Some(request) = single_frame_payload(&frame.data) else {
            continue;
        };
        if request.first() != Some(&service_id::TESTER_PRESENT) {
            debug!(request = %hex::encode_upper(request), "Ignoring functional request");
            continue;
        }
        for response in ecu.handle(request) {
            if let Err(e) = channel.send_payload(&response).await {
                error!(error = %e, "Failed to answer functional tester present");
            }
        }
    }
}

/// Payload of a single frame, `None` for any other frame type
fn single_frame_payload(frame: &[u8]) -> Option<&[u8]> {
    let (&pci, rest) = frame.split_first()?;
    let length = (pci & 0x0F) as usize;
    if pci & 0xF0 != 0x00 || length == 0 || rest.len() < length {
        return None;
    }
    Some(&rest[..length])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcuConfig;
    use pretty_assertions::assert_eq;
    use sbl_transport::{TransportAdapter, VirtualBus};

    fn link() -> IsoTpConfig {
        IsoTpConfig::new(SignalId::new("TesterReq", "Diag"), SignalId::new("EcuResp", "Diag"))
    }

    #[test]
    fn test_single_frame_payload() {
        assert_eq!(single_frame_payload(&[0x02, 0x3E, 0x80, 0, 0]), Some(&[0x3E, 0x80][..]));
        assert_eq!(single_frame_payload(&[0x10, 0x14, 0x36]), None);
        assert_eq!(single_frame_payload(&[0x05, 0x22]), None);
        assert_eq!(single_frame_payload(&[]), None);
    }

    #[tokio::test]
    async fn test_physical_and_functional_requests() {
        let bus = Arc::new(VirtualBus::new());
        let ecu = Arc::new(SimulatedEcu::new(&EcuConfig::default()).unwrap());
        let functional = SignalId::new("FunctionalReq", "Diag");
        let handle = EcuServer::new(ecu, bus.clone(), link().reversed())
            .with_functional(functional.clone())
            .spawn();

        let tester = IsoTpChannel::new(bus.clone(), Arc::new(TransportSession::new()), link());
        let timeout = Duration::from_secs(1);

        let response = tester.send_receive(&[0x22, 0xF1, 0x90], timeout).await.unwrap();
        assert_eq!(&response[..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&response[3..], b"YV1SIM00000000001");

        bus.publish(&functional, &[0x02, 0x3E, 0x00, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        assert_eq!(tester.receive(timeout).await.unwrap(), vec![0x7E, 0x00]);

        assert!(handle.is_running());
        handle.shutdown().await;
    }
}
