//! Engine runtime.
//!
//! One owner for every background task: the reconciler loop and the worker
//! pool. Subscriptions and workqueue handlers are registered before
//! [`Runtime::start`], so the hot dispatch paths never contend on
//! registration locks. Shutdown broadcasts once and then drains each task
//! within a bounded window; in-flight broker calls finish.

mod workqueue;

pub use workqueue::{TaskFuture, WorkQueue, WorkQueueHandle, WorkerStats};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::execution::Reconciler;

/// Bound on the shutdown drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the reconciler task and the worker pool.
///
/// Startup is staged so every bus subscription and workqueue handler is in
/// place before the reconciler can publish: workers first, then pipeline
/// wiring, then [`Runtime::start_reconciler`] last.
pub struct Runtime {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create a runtime with nothing running yet.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Start `workers` queue workers and return the submission handle.
    #[must_use]
    pub fn start_workqueue(&mut self, queue: WorkQueue, workers: usize) -> WorkQueueHandle {
        let (queue_handle, worker_handles) = queue.start(workers, &self.shutdown_tx);
        self.handles.extend(worker_handles);
        queue_handle
    }

    /// Start the reconciliation loop. Call after the pipeline is wired.
    pub fn start_reconciler(&mut self, reconciler: &Arc<Reconciler>) {
        self.handles.push(reconciler.spawn(self.shutdown_tx.subscribe()));
        info!(tasks = self.handles.len(), "runtime started");
    }

    /// Signal every task and wait for them, bounded by the shutdown window.
    pub async fn shutdown(self) {
        info!("runtime shutting down");
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("runtime tasks did not stop within the shutdown window");
        } else {
            info!("runtime stopped cleanly");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("tasks", &self.handles.len())
            .finish_non_exhaustive()
    }
}
