//! Worker queue for heavy sinks.
//!
//! Chart rendering, operator notifications and other IO-heavy work is
//! offloaded here so the pipeline thread never blocks on a sink. Handlers
//! are registered by task name before the workers start; submission is a
//! non-blocking channel send. Workers never call back into the pipeline;
//! anything they need to say goes through the bus gate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Future type returned by task handlers.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'static>>;

type TaskHandlerFn = Arc<dyn Fn(serde_json::Value) -> TaskFuture + Send + Sync + 'static>;

struct Task {
    name: String,
    payload: serde_json::Value,
}

/// Worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Tasks completed successfully.
    pub processed: AtomicU64,
    /// Tasks that failed or had no handler.
    pub failed: AtomicU64,
}

/// Builder half: register handlers, then start the pool.
#[derive(Default)]
pub struct WorkQueue {
    handlers: HashMap<String, TaskHandlerFn>,
}

/// Submission half, cheap to clone into the pipeline.
#[derive(Clone)]
pub struct WorkQueueHandle {
    tx: mpsc::UnboundedSender<Task>,
    stats: Arc<WorkerStats>,
}

impl WorkQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one task name. Call before `start`.
    pub fn register<F>(&mut self, task_name: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> TaskFuture + Send + Sync + 'static,
    {
        self.handlers.insert(task_name.to_string(), Arc::new(handler));
        debug!(task = task_name, "workqueue handler registered");
    }

    /// Start `workers` worker tasks draining the queue.
    ///
    /// Returns the submission handle and the worker join handles (owned by
    /// the runtime for shutdown).
    #[must_use]
    pub fn start(
        self,
        workers: usize,
        shutdown: &broadcast::Sender<()>,
    ) -> (WorkQueueHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handlers = Arc::new(self.handlers);
        let stats = Arc::new(WorkerStats::default());

        let mut join_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let handlers = Arc::clone(&handlers);
            let stats = Arc::clone(&stats);
            let mut shutdown_rx = shutdown.subscribe();

            join_handles.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    let task = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        task = async { rx.lock().await.recv().await } => task,
                    };
                    let Some(task) = task else { break };

                    match handlers.get(&task.name) {
                        Some(handler) => match handler(task.payload).await {
                            Ok(()) => {
                                stats.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                stats.failed.fetch_add(1, Ordering::Relaxed);
                                error!(worker_id, task = %task.name, error = %e, "task failed");
                            }
                        },
                        None => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(worker_id, task = %task.name, "no handler for task");
                        }
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }

        info!(workers, "workqueue started");
        (WorkQueueHandle { tx, stats }, join_handles)
    }
}

impl WorkQueueHandle {
    /// Enqueue a task. Never blocks; after shutdown the task is dropped
    /// with a WARN.
    pub fn submit(&self, task_name: &str, payload: serde_json::Value) {
        let task = Task {
            name: task_name.to_string(),
            payload,
        };
        if self.tx.send(task).is_err() {
            warn!(task = task_name, "workqueue stopped; task dropped");
        }
    }

    /// Tasks completed successfully so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    /// Tasks failed (including missing handlers) so far.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WorkQueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueueHandle")
            .field("processed", &self.processed())
            .field("failed", &self.failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn settle(handle: &WorkQueueHandle, expected: u64) {
        for _ in 0..100 {
            if handle.processed() + handle.failed() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn tasks_reach_registered_handler() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut queue = WorkQueue::new();

        let sink = Arc::clone(&seen);
        queue.register("echo", move |payload| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(payload);
                Ok(())
            })
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let (handle, workers) = queue.start(2, &shutdown_tx);

        handle.submit("echo", json!({"n": 1}));
        handle.submit("echo", json!({"n": 2}));
        settle(&handle, 2).await;

        assert_eq!(handle.processed(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);

        shutdown_tx.send(()).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_task_counts_as_failed() {
        let queue = WorkQueue::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (handle, _workers) = queue.start(1, &shutdown_tx);

        handle.submit("nobody-home", json!({}));
        settle(&handle, 1).await;

        assert_eq!(handle.failed(), 1);
        assert_eq!(handle.processed(), 0);
    }

    #[tokio::test]
    async fn failing_handler_keeps_workers_alive() {
        let mut queue = WorkQueue::new();
        queue.register("boom", |_| Box::pin(async { Err("intentional".to_string()) }));

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let sink = Arc::clone(&flag);
        queue.register("after", move |_| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let (handle, _workers) = queue.start(1, &shutdown_tx);

        handle.submit("boom", json!({}));
        handle.submit("after", json!({}));
        settle(&handle, 2).await;

        assert_eq!(handle.failed(), 1);
        assert!(flag.load(Ordering::SeqCst));
    }
}
