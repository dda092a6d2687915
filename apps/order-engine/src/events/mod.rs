//! Domain events for the trading pipeline.
//!
//! Every event is immutable, carries a UTC timestamp, and is owned by its
//! emitter until dispatch; subscribers receive events by value. The
//! [`Event`] sum type is what travels over the bus; [`EventKind`] is the
//! subscription key.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Side;

/// A strategy detected a trading opportunity.
///
/// Strategies attach the indicator snapshot the safety gate validates
/// against; nothing else is required of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDetected {
    /// Trading symbol.
    pub symbol: String,
    /// Proposed direction.
    pub side: Side,
    /// Signal strength in [0, 1].
    pub strength: f64,
    /// Strategy that produced the signal.
    pub strategy_id: String,
    /// Last close price.
    pub close: Decimal,
    /// Fast moving average.
    pub ma_fast: Decimal,
    /// Slow moving average.
    pub ma_slow: Decimal,
    /// Relative strength index.
    pub rsi: f64,
    /// Average true range.
    pub atr: Decimal,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// Outcome of the safety gate for a signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validated {
    /// Trading symbol.
    pub symbol: String,
    /// Proposed direction.
    pub side: Side,
    /// Rejection reason; `None` means the signal passed every check.
    pub reason: Option<String>,
    /// Gate-computed lot size.
    pub lot: Decimal,
    /// Stop distance in price points.
    pub sl_points: Decimal,
    /// Target distance in price points.
    pub tp_points: Decimal,
    /// ATR the gate validated against (reused for absolute stop placement).
    pub atr: Decimal,
    /// Strategy that produced the signal.
    pub strategy_id: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

impl Validated {
    /// Whether the signal passed validation.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.reason.is_none()
    }
}

/// Sizing approved the trade with concrete quantity and stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskApproved {
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Approved quantity in lots.
    pub qty: Decimal,
    /// Absolute stop loss price.
    pub sl: Decimal,
    /// Absolute take profit price.
    pub tp: Decimal,
    /// Strategy that produced the signal.
    pub strategy_id: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// The risk governor refused the trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBlocked {
    /// Trading symbol.
    pub symbol: String,
    /// Proposed direction.
    pub side: Side,
    /// Which sub-state blocked, e.g. "loss_streak cooldown active".
    pub reason: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// An order request is ready for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// Deterministic client order id.
    pub client_order_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Quantity in lots.
    pub qty: Decimal,
    /// Absolute stop loss price.
    pub sl: Option<Decimal>,
    /// Absolute take profit price.
    pub tp: Option<Decimal>,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// The order did not reach an executed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejected {
    /// Client order id.
    pub client_order_id: String,
    /// Machine-parseable reason token plus human detail.
    pub reason: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// A pending order was picked up by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingActivated {
    /// Client order id.
    pub client_order_id: String,
    /// Broker-assigned order id.
    pub broker_order_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Quantity in lots.
    pub qty: Decimal,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// A deal filled part of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartiallyFilled {
    /// Client order id.
    pub client_order_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Volume of this fill.
    pub fill_qty: Decimal,
    /// Price of this fill.
    pub fill_price: Decimal,
    /// Cumulative filled volume.
    pub total_filled: Decimal,
    /// Volume still working.
    pub remaining_qty: Decimal,
    /// Volume-weighted average fill price so far.
    pub avg_fill_price: Decimal,
    /// Venue deal ticket.
    pub deal_ticket: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// An order is completely filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filled {
    /// Client order id.
    pub client_order_id: String,
    /// Broker order id (or deal ticket when that is all the venue reports).
    pub broker_order_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Total filled quantity.
    pub qty: Decimal,
    /// Volume-weighted average fill price.
    pub price: Decimal,
    /// Venue deal ticket of the completing deal, when known.
    pub deal_ticket: Option<String>,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// An order disappeared from the broker without filling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancelled {
    /// Client order id.
    pub client_order_id: String,
    /// Trading symbol.
    pub symbol: String,
    /// Why the order is considered cancelled.
    pub reason: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// A stop loss / take profit modification was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopUpdateRequested {
    /// Client order id.
    pub client_order_id: String,
    /// New stop loss price.
    pub sl: Option<Decimal>,
    /// New take profit price.
    pub tp: Option<Decimal>,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// A stop loss / take profit modification was confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopUpdated {
    /// Client order id.
    pub client_order_id: String,
    /// Applied stop loss price.
    pub sl: Option<Decimal>,
    /// Applied take profit price.
    pub tp: Option<Decimal>,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// Cancellation of a working order was requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequested {
    /// Client order id.
    pub client_order_id: String,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// A position was closed and realized a profit or loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeClosed {
    /// Trading symbol.
    pub symbol: String,
    /// Realized profit (positive) or loss (negative).
    pub pnl: Decimal,
    /// Why the position closed (stop, target, manual).
    pub close_reason: Option<String>,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// A chart render was requested for an operator notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartRequested {
    /// Trading symbol.
    pub symbol: String,
    /// Chart timeframe in minutes.
    pub timeframe_min: u32,
    /// Event time (UTC).
    pub ts: DateTime<Utc>,
}

/// The pipeline event sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Event {
    SignalDetected(SignalDetected),
    Validated(Validated),
    RiskApproved(RiskApproved),
    TradeBlocked(TradeBlocked),
    OrderPlaced(OrderPlaced),
    Rejected(Rejected),
    PendingActivated(PendingActivated),
    PartiallyFilled(PartiallyFilled),
    Filled(Filled),
    Cancelled(Cancelled),
    StopUpdateRequested(StopUpdateRequested),
    StopUpdated(StopUpdated),
    CancelRequested(CancelRequested),
    TradeClosed(TradeClosed),
    ChartRequested(ChartRequested),
}

/// Subscription key: the discriminant of [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum EventKind {
    SignalDetected,
    Validated,
    RiskApproved,
    TradeBlocked,
    OrderPlaced,
    Rejected,
    PendingActivated,
    PartiallyFilled,
    Filled,
    Cancelled,
    StopUpdateRequested,
    StopUpdated,
    CancelRequested,
    TradeClosed,
    ChartRequested,
}

impl Event {
    /// The subscription key of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::SignalDetected(_) => EventKind::SignalDetected,
            Self::Validated(_) => EventKind::Validated,
            Self::RiskApproved(_) => EventKind::RiskApproved,
            Self::TradeBlocked(_) => EventKind::TradeBlocked,
            Self::OrderPlaced(_) => EventKind::OrderPlaced,
            Self::Rejected(_) => EventKind::Rejected,
            Self::PendingActivated(_) => EventKind::PendingActivated,
            Self::PartiallyFilled(_) => EventKind::PartiallyFilled,
            Self::Filled(_) => EventKind::Filled,
            Self::Cancelled(_) => EventKind::Cancelled,
            Self::StopUpdateRequested(_) => EventKind::StopUpdateRequested,
            Self::StopUpdated(_) => EventKind::StopUpdated,
            Self::CancelRequested(_) => EventKind::CancelRequested,
            Self::TradeClosed(_) => EventKind::TradeClosed,
            Self::ChartRequested(_) => EventKind::ChartRequested,
        }
    }

    /// Event time (UTC).
    #[must_use]
    pub const fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::SignalDetected(e) => e.ts,
            Self::Validated(e) => e.ts,
            Self::RiskApproved(e) => e.ts,
            Self::TradeBlocked(e) => e.ts,
            Self::OrderPlaced(e) => e.ts,
            Self::Rejected(e) => e.ts,
            Self::PendingActivated(e) => e.ts,
            Self::PartiallyFilled(e) => e.ts,
            Self::Filled(e) => e.ts,
            Self::Cancelled(e) => e.ts,
            Self::StopUpdateRequested(e) => e.ts,
            Self::StopUpdated(e) => e.ts,
            Self::CancelRequested(e) => e.ts,
            Self::TradeClosed(e) => e.ts,
            Self::ChartRequested(e) => e.ts,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SignalDetected => "SignalDetected",
            Self::Validated => "Validated",
            Self::RiskApproved => "RiskApproved",
            Self::TradeBlocked => "TradeBlocked",
            Self::OrderPlaced => "OrderPlaced",
            Self::Rejected => "Rejected",
            Self::PendingActivated => "PendingActivated",
            Self::PartiallyFilled => "PartiallyFilled",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::StopUpdateRequested => "StopUpdateRequested",
            Self::StopUpdated => "StopUpdated",
            Self::CancelRequested => "CancelRequested",
            Self::TradeClosed => "TradeClosed",
            Self::ChartRequested => "ChartRequested",
        };
        f.write_str(name)
    }
}
