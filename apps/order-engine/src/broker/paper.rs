//! Paper broker: in-process simulation of the broker port.
//!
//! Market orders fill immediately at the simulated quote plus slippage; the
//! fill is recorded as a deal whose comment carries the client order id, so
//! the reconciler observes paper fills exactly the way it observes venue
//! fills. Positions, balance and deal history live in memory.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use super::{BrokerError, BrokerGateway};
use crate::models::{
    Deal, OpenOrder, OrderRequest, OrderResult, OrderType, Position, Side, SymbolInfo, Tick,
};

/// Simulated per-lot slippage in price points.
const SLIPPAGE: Decimal = dec!(0.02);

struct PaperState {
    connected: bool,
    next_ticket: u64,
    balance: Decimal,
    positions: HashMap<String, Position>,
    deals: Vec<Deal>,
    markets: HashMap<String, Tick>,
    atr: Decimal,
}

/// Simulation implementation of [`BrokerGateway`].
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    /// Create a paper broker with the given starting balance.
    #[must_use]
    pub fn new(initial_balance: Decimal) -> Self {
        let mut markets = HashMap::new();
        markets.insert(
            "XAUUSD".to_string(),
            Tick {
                bid: dec!(2500.50),
                ask: dec!(2500.80),
            },
        );
        markets.insert(
            "EURUSD".to_string(),
            Tick {
                bid: dec!(1.0950),
                ask: dec!(1.0952),
            },
        );
        markets.insert(
            "GBPUSD".to_string(),
            Tick {
                bid: dec!(1.2650),
                ask: dec!(1.2653),
            },
        );

        info!(%initial_balance, "paper broker initialized");
        Self {
            state: Mutex::new(PaperState {
                connected: false,
                next_ticket: 1,
                balance: initial_balance,
                positions: HashMap::new(),
                deals: Vec::new(),
                markets,
                atr: dec!(2.0),
            }),
        }
    }

    /// Override the simulated quote for a symbol.
    pub fn set_tick(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state.markets.insert(symbol.to_string(), Tick { bid, ask });
        }
    }

    /// Override the simulated ATR.
    pub fn set_atr(&self, atr: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state.atr = atr;
        }
    }

    /// Apply a realized profit or loss to the simulated balance.
    pub fn apply_pnl(&self, pnl: Decimal) {
        if let Ok(mut state) = self.state.lock() {
            state.balance += pnl;
        }
    }

    fn fill_price(state: &PaperState, symbol: &str, side: Side) -> Decimal {
        let tick = state.markets.get(symbol).copied().unwrap_or(Tick {
            bid: dec!(1.0000),
            ask: dec!(1.0002),
        });
        // Slippage always moves the price against the taker.
        match side {
            Side::Buy => tick.price_for(side) + SLIPPAGE,
            Side::Sell => tick.price_for(side) - SLIPPAGE,
        }
    }

    fn next_ticket(state: &mut PaperState, prefix: &str) -> String {
        let ticket = format!("{prefix}{}", state.next_ticket);
        state.next_ticket += 1;
        ticket
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;
        state.connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;

        if !state.connected {
            return Err(BrokerError::Unreachable(
                "paper broker not connected".to_string(),
            ));
        }

        if request.qty <= Decimal::ZERO {
            return Ok(OrderResult::rejected("INVALID_VOLUME"));
        }
        if request.order_type != OrderType::Market {
            // The simulation has no resting book; only market orders fill.
            return Ok(OrderResult::rejected("UNSUPPORTED_ORDER_TYPE"));
        }

        let price = Self::fill_price(&state, &request.symbol, request.side);
        let position_ticket = Self::next_ticket(&mut state, "P");
        let deal_ticket = Self::next_ticket(&mut state, "D");
        let now = Utc::now();

        state.positions.insert(
            position_ticket.clone(),
            Position {
                ticket: position_ticket.clone(),
                comment: request.client_order_id.clone(),
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.qty,
                entry_price: price,
                open_time: now,
                sl: request.sl,
                tp: request.tp,
            },
        );

        state.deals.push(Deal {
            ticket: deal_ticket,
            comment: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.qty,
            price,
            time: now,
        });

        debug!(
            coid = %request.client_order_id,
            symbol = %request.symbol,
            side = %request.side,
            qty = %request.qty,
            %price,
            "paper order filled"
        );

        Ok(OrderResult::accepted(position_ticket))
    }

    async fn cancel(&self, _broker_order_id: &str) -> Result<bool, BrokerError> {
        // Market orders fill instantly; there is never anything to cancel.
        Ok(false)
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;
        Ok(state.positions.values().cloned().collect())
    }

    async fn close_position(
        &self,
        ticket: &str,
        volume: Decimal,
    ) -> Result<OrderResult, BrokerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;

        let Some(position) = state.positions.get(ticket).cloned() else {
            return Ok(OrderResult::rejected(format!(
                "POSITION_NOT_FOUND: {ticket}"
            )));
        };

        let close_side = position.side.opposite();
        let price = Self::fill_price(&state, &position.symbol, close_side);
        let deal_ticket = Self::next_ticket(&mut state, "D");

        if volume >= position.volume {
            state.positions.remove(ticket);
        } else if let Some(p) = state.positions.get_mut(ticket) {
            p.volume -= volume;
        }

        state.deals.push(Deal {
            ticket: deal_ticket.clone(),
            comment: format!("close_{ticket}"),
            symbol: position.symbol,
            side: close_side,
            volume: volume.min(position.volume),
            price,
            time: Utc::now(),
        });

        Ok(OrderResult::accepted(deal_ticket))
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        Ok(Vec::new())
    }

    async fn history_deals(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        symbol: &str,
    ) -> Result<Vec<Deal>, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;
        Ok(state
            .deals
            .iter()
            .filter(|d| d.symbol == symbol && d.time >= since && d.time <= until)
            .cloned()
            .collect())
    }

    async fn symbol_info_tick(&self, symbol: &str) -> Result<Tick, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;
        state
            .markets
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Protocol(format!("no market data for {symbol}")))
    }

    async fn symbol_info(&self, _symbol: &str) -> Result<SymbolInfo, BrokerError> {
        Ok(SymbolInfo {
            tick_size: dec!(0.01),
            tick_value: dec!(1.0),
            volume_min: dec!(0.01),
            volume_max: dec!(100.0),
            volume_step: dec!(0.01),
        })
    }

    async fn account_equity(&self) -> Result<Decimal, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;
        Ok(state.balance)
    }

    async fn atr(
        &self,
        _symbol: &str,
        _timeframe_min: u32,
        _period: u32,
    ) -> Result<Decimal, BrokerError> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Unreachable("paper state poisoned".to_string()))?;
        Ok(state.atr)
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperBroker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(coid: &str, side: Side, qty: Decimal) -> OrderRequest {
        OrderRequest::market(coid.to_string(), "XAUUSD".to_string(), side, qty)
    }

    #[tokio::test]
    async fn requires_connect_before_trading() {
        let broker = PaperBroker::new(dec!(10000));
        let err = broker.place_order(&request("c1", Side::Buy, dec!(0.1))).await;
        assert!(matches!(err, Err(BrokerError::Unreachable(_))));

        broker.connect().await.unwrap();
        assert!(broker.is_connected().await);
    }

    #[tokio::test]
    async fn market_order_fills_and_leaves_deal() {
        let broker = PaperBroker::new(dec!(10000));
        broker.connect().await.unwrap();

        let result = broker
            .place_order(&request("coid-1", Side::Buy, dec!(0.10)))
            .await
            .unwrap();
        assert!(result.accepted);

        let positions = broker.positions_for("XAUUSD").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].volume, dec!(0.10));

        let deals = broker
            .history_deals(Utc::now() - chrono::Duration::hours(1), Utc::now(), "XAUUSD")
            .await
            .unwrap();
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].comment, "coid-1");
        // BUY fills at ask plus slippage.
        assert_eq!(deals[0].price, dec!(2500.82));
    }

    #[tokio::test]
    async fn rejects_zero_volume() {
        let broker = PaperBroker::new(dec!(10000));
        broker.connect().await.unwrap();

        let result = broker
            .place_order(&request("coid-2", Side::Buy, dec!(0)))
            .await
            .unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason.as_deref(), Some("INVALID_VOLUME"));
    }

    #[tokio::test]
    async fn close_position_partial_and_full() {
        let broker = PaperBroker::new(dec!(10000));
        broker.connect().await.unwrap();

        let result = broker
            .place_order(&request("coid-3", Side::Buy, dec!(0.30)))
            .await
            .unwrap();
        let ticket = result.broker_order_id.unwrap();

        broker.close_position(&ticket, dec!(0.10)).await.unwrap();
        let positions = broker.positions_for("XAUUSD").await.unwrap();
        assert_eq!(positions[0].volume, dec!(0.20));

        broker.close_position(&ticket, dec!(0.20)).await.unwrap();
        assert!(broker.positions_for("XAUUSD").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_unknown_position_rejected() {
        let broker = PaperBroker::new(dec!(10000));
        broker.connect().await.unwrap();
        let result = broker.close_position("P999", dec!(0.1)).await.unwrap();
        assert!(!result.accepted);
    }

    #[tokio::test]
    async fn history_deals_respects_window() {
        let broker = PaperBroker::new(dec!(10000));
        broker.connect().await.unwrap();
        broker
            .place_order(&request("coid-4", Side::Sell, dec!(0.10)))
            .await
            .unwrap();

        let past = broker
            .history_deals(
                Utc::now() - chrono::Duration::hours(2),
                Utc::now() - chrono::Duration::hours(1),
                "XAUUSD",
            )
            .await
            .unwrap();
        assert!(past.is_empty());
    }
}
