// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Order Engine - Core Library
//!
//! Event-driven order lifecycle engine: strategy signals become validated,
//! risk-checked, idempotently submitted broker orders, and the local order
//! book is continuously reconciled against the venue's deal history.
//!
//! # Architecture
//!
//! Everything hangs off a typed in-process event bus:
//!
//! - **Pipeline** (`pipeline`): `SignalDetected -> Validated ->
//!   RiskApproved -> OrderPlaced`, then execution and fill confirmation.
//! - **Gates** (`risk`, `safety`): the risk governor (session budget, loss
//!   streak, news blackout) runs first, then the safety gate (daily limits,
//!   session window, cooldown, news, indicator validation).
//! - **Execution** (`execution`): the idempotent executor (persistent
//!   dedup ledger + position netting), the order book, and the background
//!   reconciler that replays broker deal history.
//! - **Ports** (`broker`, `news`, `alerts`): one venue behind
//!   `BrokerGateway` (MT5 bridge or paper simulation), a news calendar,
//!   and an operator alert sink fed through the work queue.
//!
//! State that must survive a restart lives in one Turso database
//! (idempotency ledger + order book) and two small JSON documents
//! (governor state, daily limits).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Operator alerting port.
pub mod alerts;

/// Broker port and adapters.
pub mod broker;

/// In-process event bus.
pub mod bus;

/// Configuration loading and validation.
pub mod config;

/// Domain events.
pub mod events;

/// Executor, order book and reconciler.
pub mod execution;

/// Persistent idempotency ledger.
pub mod idempotency;

/// Broker-agnostic trading models.
pub mod models;

/// Economic news calendar.
pub mod news;

/// Pipeline orchestrator.
pub mod pipeline;

/// Position netting policy and aggregation.
pub mod positions;

/// Risk governor and sizing.
pub mod risk;

/// Background task ownership and the work queue.
pub mod runtime;

/// Safety gate and daily limits.
pub mod safety;

// =============================================================================
// Re-exports
// =============================================================================

pub use broker::{BrokerGateway, Mt5BridgeBroker, PaperBroker};
pub use bus::EventBus;
pub use config::{load_config, Config};
pub use events::{Event, EventKind};
pub use execution::{
    make_coid, minute_bucket, IdempotentExecutor, OrderBook, OrderStatus, Reconciler,
};
pub use idempotency::IdempotencyStore;
pub use models::{OrderRequest, OrderResult, OrderType, Position, Side};
pub use pipeline::Pipeline;
pub use positions::{NettingMode, PositionAggregator, ReduceRule};
pub use risk::RiskGovernor;
pub use runtime::{Runtime, WorkQueue};
pub use safety::{LimitsManager, SafetyGate};
