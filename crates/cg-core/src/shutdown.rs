use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::info;

use cg_types::Result;

use crate::endpoint::ProtectedEndpoint;

/// Emergency stop for every registered endpoint.
///
/// On the first shutdown request all endpoint queues are cleared, so callers
/// waiting on queued work get [`cg_types::CallGuardError::QueueCleared`]
/// instead of hanging. Calls already executing are left to finish.
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    is_shutting_down: AtomicBool,
    endpoints: Mutex<Vec<Arc<ProtectedEndpoint>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx: tx,
            is_shutting_down: AtomicBool::new(false),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, endpoint: Arc<ProtectedEndpoint>) {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(endpoint);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    /// Subscribe to the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Clear every endpoint's queue and notify subscribers.
    ///
    /// Only the first call does anything. Returns the number of queued
    /// calls that were rejected.
    pub async fn request_shutdown(&self) -> usize {
        if self.is_shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        info!("Shutdown requested, clearing request queues");

        let endpoints: Vec<Arc<ProtectedEndpoint>> = self
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut cleared = 0;
        for endpoint in &endpoints {
            let count = endpoint.clear().await;
            info!(endpoint = endpoint.name(), count, "Endpoint queue cleared");
            cleared += count;
        }

        let _ = self.shutdown_tx.send(());
        cleared
    }

    /// Wait for SIGINT / SIGTERM (Ctrl+C elsewhere), then shut down.
    pub async fn wait_for_signal(&self) -> Result<usize> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C");
        }
        Ok(self.request_shutdown().await)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
