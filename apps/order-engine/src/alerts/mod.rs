//! Operator alerting port.
//!
//! The engine raises alerts for risk blocks, unreachable brokers, and
//! sustained reconciliation timeouts. Concrete transports (Telegram, mail)
//! live outside the engine; they implement [`AlertSink`] and consume from
//! the work queue. The default sink writes to the log.

use async_trait::async_trait;
use tracing::{error, info, warn};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    /// Informational.
    Info,
    /// Needs operator attention soon.
    Warning,
    /// Needs operator attention now.
    Critical,
}

/// Port for operator notifications.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    async fn notify(&self, level: AlertLevel, message: &str);
}

/// Sink that writes alerts to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Info => info!(alert = message, "operator alert"),
            AlertLevel::Warning => warn!(alert = message, "operator alert"),
            AlertLevel::Critical => error!(alert = message, "operator alert"),
        }
    }
}
