//! Graceful Shutdown Handling
//!
//! Turns SIGTERM/SIGINT into a broadcast that stops the relay and the
//! management server.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::controller::{PacketHolder, RelayState};
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    /// Upper bound for stopping the relay
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Notify every subscriber
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("No component was listening for the shutdown signal");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop the relay if it is active, bounded by the shutdown timeout
    pub async fn shutdown_holder(&self, holder: &PacketHolder) -> Result<()> {
        if holder.state() == RelayState::Idle {
            info!("Relay already idle");
            return Ok(());
        }

        match tokio::time::timeout(self.timeout, holder.stop()).await {
            Ok(Ok(())) => {
                info!("Relay stopped");
                Ok(())
            }
            // Finished on its own between the check and stop()
            Ok(Err(e)) if e.is_lifecycle_misuse() => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow::anyhow!(
                "Relay did not stop within {:?}",
                self.timeout
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut first = coordinator.subscribe();
        let mut second = coordinator.subscribe();

        coordinator.trigger();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_idle_holder() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        assert!(coordinator.shutdown_holder(&PacketHolder::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_stops_starting_holder() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let holder = PacketHolder::new();
        holder
            .start(
                "127.0.0.1:0".parse().unwrap(),
                "127.0.0.1:9".parse().unwrap(),
                crate::controller::StartMode::Background,
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        coordinator.shutdown_holder(&holder).await.unwrap();
        assert_eq!(holder.state(), RelayState::Idle);
    }
}
