//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal never interrupts a VM in the middle of its snapshot/commit window:
//! it only sets the stop flag, the runner finishes the current VM and skips the
//! rest of the queue.

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx }
    }

    /// Get a handle the runner can poll between VMs
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Set the stop flag
    pub fn trigger(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for SIGTERM or SIGINT, then set the stop flag
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), finishing the current VM and stopping");
            }
            _ = terminate => {
                info!("Received SIGTERM, finishing the current VM and stopping");
            }
        }

        self.trigger();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the stop flag
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // keep the value readable after the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}
