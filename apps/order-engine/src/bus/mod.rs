//! In-process event bus.
//!
//! Typed publish/subscribe over the [`Event`](crate::events::Event) sum
//! type. Dispatch is sequential: when `publish` completes, every handler
//! registered for the event's kind has run, in registration order. A
//! failing handler is isolated: its error is counted and logged and the
//! remaining handlers still run; publishing itself never fails.
//!
//! Handlers may publish follow-up events re-entrantly (the pipeline
//! cascade). Publishers on other tasks must serialize through
//! [`EventBus::publish_guarded`], which takes the bus gate first; the
//! reconciler is the only such publisher. Subscriptions are registered
//! before the runtime starts, so dispatch reads the handler table without
//! contention.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, error};

use crate::events::{Event, EventKind};

/// Error returned by an event handler.
///
/// Handlers convert their domain failures into this type so the bus can
/// count and log them uniformly without unwinding the dispatch loop.
#[derive(Debug, Error)]
#[error("handler '{handler}' failed: {message}")]
pub struct HandlerError {
    /// Registration name of the failing handler.
    pub handler: String,
    /// What went wrong.
    pub message: String,
}

impl HandlerError {
    /// Create a handler error.
    #[must_use]
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// Future type returned by event handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

type HandlerFn = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync + 'static>;

struct Registration {
    name: String,
    handler: HandlerFn,
}

/// Bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Total events dispatched.
    pub events_published: u64,
    /// Total handler invocations.
    pub handlers_called: u64,
    /// Handler invocations that returned an error.
    pub handler_errors: u64,
}

/// Synchronous-per-publish typed event bus.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Registration>>>,
    gate: tokio::sync::Mutex<()>,
    events_published: AtomicU64,
    handlers_called: AtomicU64,
    handler_errors: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    ///
    /// Handlers run in registration order. The `name` identifies the
    /// handler in logs and is the key for [`EventBus::unsubscribe`].
    pub fn subscribe<F>(&self, kind: EventKind, name: &str, handler: F)
    where
        F: Fn(Event) -> HandlerFuture + Send + Sync + 'static,
    {
        let registration = Registration {
            name: name.to_string(),
            handler: Arc::new(handler),
        };
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.entry(kind).or_default().push(registration);
        }
        debug!(kind = %kind, handler = name, "subscribed handler");
    }

    /// Remove a handler by registration name. O(n) in the handler list.
    ///
    /// Returns true when a handler was found and removed.
    pub fn unsubscribe(&self, kind: EventKind, name: &str) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.name != name);
        let removed = list.len() < before;
        if removed {
            debug!(kind = %kind, handler = name, "unsubscribed handler");
        }
        removed
    }

    /// Dispatch an event to every handler registered for its kind.
    ///
    /// Safe to call re-entrantly from inside a handler; the nested dispatch
    /// completes before the handler resumes. Callers on other tasks should
    /// use [`EventBus::publish_guarded`] instead.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        let snapshot: Vec<(String, HandlerFn)> = {
            match self.handlers.read() {
                Ok(handlers) => handlers
                    .get(&kind)
                    .map(|list| {
                        list.iter()
                            .map(|r| (r.name.clone(), Arc::clone(&r.handler)))
                            .collect()
                    })
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            }
        };

        self.events_published.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %kind, handlers = snapshot.len(), "publishing event");

        for (name, handler) in snapshot {
            match handler(event.clone()).await {
                Ok(()) => {
                    self.handlers_called.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.handlers_called.fetch_add(1, Ordering::Relaxed);
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("bus_handler_errors", "kind" => kind.to_string())
                        .increment(1);
                    error!(kind = %kind, handler = %name, error = %e, "event handler failed");
                }
            }
        }
    }

    /// Dispatch under the bus gate, serializing against other guarded
    /// publishers. Top-level entry point for non-pipeline tasks.
    pub async fn publish_guarded(&self, event: Event) {
        let _guard = self.gate.lock().await;
        self.publish(event).await;
    }

    /// Snapshot of the bus counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            handlers_called: self.handlers_called.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    /// Number of handlers registered for a kind.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
