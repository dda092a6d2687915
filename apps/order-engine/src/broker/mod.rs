//! Broker port and adapters.
//!
//! [`BrokerGateway`] is the single seam between the engine and the venue.
//! Expected trade failures (rejections) come back inside [`OrderResult`];
//! only infrastructure failures (connectivity, malformed responses) surface
//! as [`BrokerError`]. The executor converts the latter into rejected
//! results so nothing above it deals in broker errors.
//!
//! Two adapters ship with the engine: [`PaperBroker`] (in-process
//! simulation) and [`Mt5BridgeBroker`] (HTTP bridge to an MT5 terminal).

mod mt5;
mod paper;

pub use mt5::Mt5BridgeBroker;
pub use paper::PaperBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Deal, OpenOrder, OrderRequest, OrderResult, Position, SymbolInfo, Tick};

/// Infrastructure-level broker failures.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The venue cannot be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The adapter does not implement this optional operation.
    #[error("broker operation not supported: {operation}")]
    Unsupported {
        /// Name of the missing operation.
        operation: &'static str,
    },

    /// The venue answered with something the adapter cannot interpret.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

/// Port every broker adapter implements.
///
/// One venue per engine instance; there is no internal retry loop anywhere
/// behind this trait. Retries belong to the caller via a fresh client
/// order id.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Establish the connection to the venue.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Whether the venue is currently reachable and ready to trade.
    async fn is_connected(&self) -> bool;

    /// Submit an order. Rejections are `Ok` results with `accepted: false`.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError>;

    /// Cancel a resting order by broker id. Returns whether anything was
    /// cancelled.
    async fn cancel(&self, broker_order_id: &str) -> Result<bool, BrokerError>;

    /// All open positions.
    async fn positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Open positions for one symbol. Adapters without a server-side filter
    /// emulate it over [`BrokerGateway::positions`].
    async fn positions_for(&self, symbol: &str) -> Result<Vec<Position>, BrokerError> {
        Ok(self
            .positions()
            .await?
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .collect())
    }

    /// Close (part of) a position by ticket. Optional; the executor falls
    /// back to an offsetting market order when unsupported.
    async fn close_position(
        &self,
        _ticket: &str,
        _volume: Decimal,
    ) -> Result<OrderResult, BrokerError> {
        Err(BrokerError::Unsupported {
            operation: "close_position",
        })
    }

    /// Resting orders at the venue (for pending activation detection).
    async fn open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError>;

    /// Execution history for a symbol inside a time window.
    async fn history_deals(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        symbol: &str,
    ) -> Result<Vec<Deal>, BrokerError>;

    /// Current top-of-book quote.
    async fn symbol_info_tick(&self, symbol: &str) -> Result<Tick, BrokerError>;

    /// Contract details for lot sizing.
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, BrokerError>;

    /// Current account equity.
    async fn account_equity(&self) -> Result<Decimal, BrokerError>;

    /// Average true range for the symbol at the given timeframe.
    async fn atr(&self, symbol: &str, timeframe_min: u32, period: u32)
        -> Result<Decimal, BrokerError>;
}
