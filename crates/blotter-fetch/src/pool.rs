//! Worker pool lifecycle: supervised spawning and graceful shutdown.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{FetchError, Result},
    worker::FetchWorker,
};

/// Supervises a set of fetch worker tasks sharing one cancellation token.
///
/// Standard and heavy-lift workers live in the same pool; they differ only
/// in the config of the workers spawned into it.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates an empty pool around a cancellation token.
    ///
    /// Workers spawned into the pool must be constructed with a child or
    /// clone of the same token, or they will not observe shutdown.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, handles: Vec::new() }
    }

    /// Spawns a worker task into the pool.
    pub fn spawn(&mut self, worker: FetchWorker) {
        let worker = Arc::new(worker);
        let id = worker.id();
        self.handles.push(tokio::spawn(async move {
            worker.run().await;
            info!(worker = %id, "worker task exited");
        }));
    }

    /// Number of workers spawned so far.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Signals cancellation and waits for every worker to stop.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when workers are still running after the
    /// deadline; their tasks keep the cancellation signal and will exit on
    /// their own, but in-flight work may be redelivered.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.handles.len(),
            timeout_secs = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancel.cancel();

        let join_all = async {
            for handle in std::mem::take(&mut self.handles) {
                if let Err(join_error) = handle.await {
                    error!(error = %join_error, "worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(FetchError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancel.is_cancelled() {
            self.cancel.cancel();
            warn!(
                active_workers = active,
                "WorkerPool dropped without graceful shutdown, forcing cancellation"
            );
        }
    }
}
