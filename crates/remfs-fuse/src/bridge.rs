//! Runs async orchestrator calls from synchronous FUSE callbacks.
//!
//! `fuser` invokes the [`Filesystem`](fuser::Filesystem) methods on its own
//! session thread. Each call is spawned onto the tokio runtime and the
//! session thread waits on a oneshot channel, bounded by the configured I/O
//! timeout. A timed-out task is aborted so it cannot keep holding a stream or
//! handle lock.

use crate::error::{Errno, FsResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

/// Counters for bridged operations.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub operations_started: AtomicU64,
    pub operations_completed: AtomicU64,
    pub operations_timed_out: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_complete(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
    }
}

/// Error from the bridge itself, as opposed to the bridged operation.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn to_errno(&self) -> i32 {
        match self {
            BridgeError::Timeout(_) => libc::ETIMEDOUT,
            BridgeError::Cancelled => libc::ECANCELED,
        }
    }
}

/// Sync-to-async executor bound to one runtime.
#[derive(Debug, Clone)]
pub struct Bridge {
    handle: Handle,
    timeout: Duration,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    pub fn new(handle: Handle, timeout: Duration) -> Self {
        Self {
            handle,
            timeout,
            stats: BridgeStats::new(),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Runs `future` to completion on the runtime, blocking this thread.
    ///
    /// Must not be called from inside the runtime's own worker threads.
    pub fn run<F, T>(&self, future: F) -> Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.stats.record_start();
        let (tx, rx) = oneshot::channel();
        let timeout = self.timeout;

        let task = self.handle.spawn(async move {
            let result = tokio::time::timeout(timeout, future).await;
            // Receiver may already be gone
            let _ = tx.send(result);
        });

        match rx.blocking_recv() {
            Ok(Ok(value)) => {
                self.stats.record_complete();
                Ok(value)
            }
            Ok(Err(_elapsed)) => {
                task.abort();
                self.stats.record_timeout();
                warn!(?timeout, "Remote operation timed out");
                Err(BridgeError::Timeout(timeout))
            }
            Err(_closed) => {
                task.abort();
                Err(BridgeError::Cancelled)
            }
        }
    }

    /// Runs a fallible operation, folding bridge failures into its errno.
    pub fn call<F, T>(&self, future: F) -> FsResult<T>
    where
        F: Future<Output = FsResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(future).map_err(Errno::from)?
    }
}
