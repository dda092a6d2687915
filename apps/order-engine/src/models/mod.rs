//! Broker-agnostic trading models.
//!
//! Core value types shared by the executor, the order book, the reconciler
//! and the broker adapters. All volumes and prices use `rust_decimal` for
//! financial precision; lot equality is checked against [`LOT_TOLERANCE`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute lot tolerance: volumes closer than this are considered equal.
pub const LOT_TOLERANCE: Decimal = rust_decimal_macros::dec!(0.000001);

/// Trading direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Long / buy.
    Buy,
    /// Short / sell.
    Sell,
}

impl Side {
    /// The opposing direction.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Wire representation ("BUY"/"SELL").
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(ModelError::InvalidField {
                field: "side",
                message: format!("unknown side '{other}'"),
            }),
        }
    }
}

/// Order execution type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Execute at the current market price.
    Market,
    /// Execute at the given price or better.
    Limit,
    /// Trigger a market order once the price is reached.
    Stop,
}

impl OrderType {
    /// Limit and stop orders carry an explicit price.
    #[must_use]
    pub const fn requires_price(self) -> bool {
        !matches!(self, Self::Market)
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::Stop => "STOP",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(Self::Market),
            "LIMIT" => Ok(Self::Limit),
            "STOP" => Ok(Self::Stop),
            other => Err(ModelError::InvalidField {
                field: "order_type",
                message: format!("unknown order type '{other}'"),
            }),
        }
    }
}

/// Model validation errors.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// A field failed validation.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

/// Broker-agnostic order request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-generated deterministic order id (24 hex chars).
    pub client_order_id: String,
    /// Trading symbol (e.g. XAUUSD).
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Order quantity in lots. Must be positive.
    pub qty: Decimal,
    /// Order execution type.
    pub order_type: OrderType,
    /// Stop loss price.
    pub sl: Option<Decimal>,
    /// Take profit price.
    pub tp: Option<Decimal>,
    /// Limit/stop price. Required for non-market orders.
    pub price: Option<Decimal>,
}

impl OrderRequest {
    /// Create a market order request.
    #[must_use]
    pub const fn market(
        client_order_id: String,
        symbol: String,
        side: Side,
        qty: Decimal,
    ) -> Self {
        Self {
            client_order_id,
            symbol,
            side,
            qty,
            order_type: OrderType::Market,
            sl: None,
            tp: None,
            price: None,
        }
    }

    /// Attach stop loss / take profit prices.
    #[must_use]
    pub const fn with_stops(mut self, sl: Option<Decimal>, tp: Option<Decimal>) -> Self {
        self.sl = sl;
        self.tp = tp;
        self
    }

    /// Validate the request invariants.
    ///
    /// # Errors
    ///
    /// Returns an error when the quantity is not positive or a non-market
    /// order is missing a positive price.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.client_order_id.is_empty() {
            return Err(ModelError::InvalidField {
                field: "client_order_id",
                message: "must not be empty".to_string(),
            });
        }
        if self.qty <= Decimal::ZERO {
            return Err(ModelError::InvalidField {
                field: "qty",
                message: format!("must be positive, got {}", self.qty),
            });
        }
        if self.order_type.requires_price() {
            match self.price {
                Some(p) if p > Decimal::ZERO => {}
                _ => {
                    return Err(ModelError::InvalidField {
                        field: "price",
                        message: format!("{} orders require a positive price", self.order_type),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Broker order execution result.
///
/// Invariant: `accepted` implies `broker_order_id` is present; the
/// constructors keep this true by shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    /// Whether the order was accepted by the broker.
    pub accepted: bool,
    /// Broker-assigned order identifier.
    pub broker_order_id: Option<String>,
    /// Rejection reason or additional info.
    pub reason: Option<String>,
}

impl OrderResult {
    /// An accepted result carrying the broker order id.
    #[must_use]
    pub fn accepted(broker_order_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            broker_order_id: Some(broker_order_id.into()),
            reason: None,
        }
    }

    /// A rejected result carrying the reason.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            broker_order_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// An open position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Broker position ticket.
    pub ticket: String,
    /// Broker comment; MT5 carries the opening order's client order id here.
    #[serde(default)]
    pub comment: String,
    /// Trading symbol.
    pub symbol: String,
    /// Position direction.
    pub side: Side,
    /// Position volume in lots. Always positive.
    pub volume: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// When the position was opened.
    pub open_time: DateTime<Utc>,
    /// Stop loss price.
    pub sl: Option<Decimal>,
    /// Take profit price.
    pub tp: Option<Decimal>,
}

impl Position {
    /// Signed quantity: positive for long, negative for short.
    #[must_use]
    pub fn signed_qty(&self) -> Decimal {
        match self.side {
            Side::Buy => self.volume,
            Side::Sell => -self.volume,
        }
    }
}

/// A single execution report from the venue.
///
/// One order may produce multiple deals (partial fills). The deal comment
/// carries the client order id the executor attached on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    /// Venue-assigned deal ticket.
    pub ticket: String,
    /// Broker comment; equals or prefixes a client order id.
    pub comment: String,
    /// Trading symbol.
    pub symbol: String,
    /// Deal direction.
    pub side: Side,
    /// Executed volume in lots. Always positive.
    pub volume: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Execution time.
    pub time: DateTime<Utc>,
}

/// A pending order resting at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Broker order ticket.
    pub ticket: String,
    /// Broker comment; equals or prefixes a client order id.
    pub comment: String,
    /// Trading symbol.
    pub symbol: String,
}

/// Current top-of-book quote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    /// Best bid.
    pub bid: Decimal,
    /// Best ask.
    pub ask: Decimal,
}

impl Tick {
    /// The price a taker pays for the given side: ask for BUY, bid for SELL.
    #[must_use]
    pub const fn price_for(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

/// Per-symbol contract details used for lot sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Account-currency value of one tick for one lot.
    pub tick_value: Decimal,
    /// Minimum tradable volume.
    pub volume_min: Decimal,
    /// Maximum tradable volume.
    pub volume_max: Decimal,
    /// Volume increment.
    pub volume_step: Decimal,
}
