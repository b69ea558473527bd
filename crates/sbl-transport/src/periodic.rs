//! Background periodic transmission (heartbeat, tester present)
//!
//! The task owns its signal; callers talk to it over a command channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::bus::CanBus;
use crate::error::{Result, TransportError};
use crate::frame::SignalId;

#[derive(Debug)]
pub enum PeriodicCommand {
    Start { frame: Vec<u8>, interval: Duration },
    Stop,
    Shutdown,
}

/// Handle to a periodic transmit task
pub struct PeriodicSender {
    commands: mpsc::Sender<PeriodicCommand>,
    handle: JoinHandle<()>,
}

impl PeriodicSender {
    pub fn spawn(bus: Arc<dyn CanBus>, signal: SignalId) -> Self {
        let (commands, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run(bus, signal, rx));
        Self { commands, handle }
    }

    /// Start (or replace) the periodic frame
    pub async fn start(&self, frame: Vec<u8>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(TransportError::InvalidConfig(
                "periodic interval must be non-zero".to_string(),
            ));
        }
        self.command(PeriodicCommand::Start { frame, interval }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(PeriodicCommand::Stop).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.command(PeriodicCommand::Shutdown).await?;
        self.handle
            .await
            .map_err(|e| TransportError::SendFailed(format!("periodic task failed: {}", e)))
    }

    async fn command(&self, command: PeriodicCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

async fn run(bus: Arc<dyn CanBus>, signal: SignalId, mut commands: mpsc::Receiver<PeriodicCommand>) {
    let mut active: Option<(Vec<u8>, tokio::time::Interval)> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeriodicCommand::Start { frame, interval }) => {
                    debug!(%signal, period_ms = interval.as_millis() as u64, "Periodic transmit started");
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    active = Some((frame, ticker));
                }
                Some(PeriodicCommand::Stop) => {
                    debug!(%signal, "Periodic transmit stopped");
                    active = None;
                }
                Some(PeriodicCommand::Shutdown) | None => break,
            },
            _ = async {
                match active.as_mut() {
                    Some((_, ticker)) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some((frame, _)) = active.as_ref() {
                    if let Err(e) = bus.publish(&signal, frame).await {
                        warn!(%signal, error = %e, "Periodic transmit failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VirtualBus;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_start_stop() {
        let bus = Arc::new(VirtualBus::new());
        let signal = SignalId::new("TesterPresent", "Diag");
        let mut rx = bus.subscribe(&signal);
        let sender = PeriodicSender::spawn(bus.clone(), signal);

        sender
            .start(vec![0x02, 0x3E, 0x80, 0, 0, 0, 0, 0], Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let mut count = 0;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(&frame.data[..3], &[0x02, 0x3E, 0x80]);
            count += 1;
        }
        // Immediate first tick, then one per period
        assert!((3..=4).contains(&count), "got {} frames", count);

        sender.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        sender.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let bus = Arc::new(VirtualBus::new());
        let sender = PeriodicSender::spawn(bus, SignalId::new("Hb", "Diag"));
        assert!(sender.start(vec![0x00], Duration::ZERO).await.is_err());
        sender.shutdown().await.unwrap();
    }
}
