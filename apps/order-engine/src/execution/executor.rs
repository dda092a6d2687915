//! Idempotent order executor.
//!
//! The sole conduit between pipeline order requests and the broker port.
//! Guarantees:
//!
//! - **At-most-once forward**: for any client order id, the broker's
//!   `place_order` is invoked at most once across the lifetime of the
//!   ledger; duplicates come back as `DUPLICATE_COID` without touching the
//!   broker.
//! - **Netting-aware**: reduce actions dispatch first (each under a freshly
//!   minted `REDUCE_*` id), then the residual under the original id. A
//!   fully netted submission still records the id so later retries stay
//!   blocked.
//! - **Failure isolation**: a broker failure on the residual leaves the id
//!   unrecorded (the order may be retried by a later signal); a failure on
//!   one reduce action does not abort the rest.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, BrokerGateway};
use crate::idempotency::IdempotencyStore;
use crate::models::{OrderRequest, OrderResult, Position, Side, LOT_TOLERANCE};
use crate::positions::{PositionAggregator, ReduceAction};

/// Deterministically mint a client order id.
///
/// SHA-256 over `{symbol}_{side}_{strategy}_{bucket}` truncated to 24 hex
/// characters. Retries inside the same minute bucket collide by design:
/// the collision is the dedup mechanism.
#[must_use]
pub fn make_coid(symbol: &str, side: Side, strategy_id: &str, ts_bucket: &str) -> String {
    let input = format!("{symbol}_{}_{strategy_id}_{ts_bucket}", side.as_str());
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..24].to_string()
}

/// Minute-level time bucket used for coid minting (`YYYYMMDD_HHMM`).
#[must_use]
pub fn minute_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M").to_string()
}

/// Broker conduit with dedup, netting, and a persistent ledger.
pub struct IdempotentExecutor {
    broker: Arc<dyn BrokerGateway>,
    store: Arc<IdempotencyStore>,
    aggregator: PositionAggregator,
    dry_run: bool,
}

impl IdempotentExecutor {
    /// Build an executor.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        store: Arc<IdempotencyStore>,
        aggregator: PositionAggregator,
        dry_run: bool,
    ) -> Self {
        info!(
            mode = %aggregator.mode(),
            rule = %aggregator.rule(),
            dry_run,
            "idempotent executor initialized"
        );
        Self {
            broker,
            store,
            aggregator,
            dry_run,
        }
    }

    /// Place an order with the idempotency and netting guarantees.
    ///
    /// Never fails: broker errors are converted into rejected results.
    pub async fn place(&self, request: &OrderRequest) -> OrderResult {
        let coid = request.client_order_id.clone();
        let started = Instant::now();

        if let Err(e) = request.validate() {
            return OrderResult::rejected(format!("INVALID_REQUEST: {e}"));
        }

        info!(
            coid = %coid,
            symbol = %request.symbol,
            side = %request.side,
            qty = %request.qty,
            "processing order"
        );

        // G1: dedup against the persistent ledger.
        if self.store.already_sent(&coid).await {
            warn!(coid = %coid, "duplicate order blocked");
            metrics::counter!("orders_duplicate", "symbol" => request.symbol.clone()).increment(1);
            return OrderResult::rejected("DUPLICATE_COID");
        }

        if self.dry_run {
            let synthetic = format!("DRYRUN_{coid}");
            self.store
                .record(&coid, Some(&synthetic), &request.symbol, request.side, request.qty)
                .await;
            info!(coid = %coid, "dry run: synthetic acceptance recorded");
            return OrderResult::accepted(synthetic);
        }

        // G2: consult the aggregator against current broker positions.
        let existing = match self.broker.positions_for(&request.symbol).await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(
                    coid = %coid,
                    error = %e,
                    "cannot read positions; netting against empty book"
                );
                Vec::new()
            }
        };

        let netting = self
            .aggregator
            .process(request.side, request.qty, request.price, &existing);
        info!(coid = %coid, summary = %netting.summary, "netting result");

        for action in &netting.reduce_actions {
            let result = self.execute_reduce(request, action).await;
            if !result.accepted {
                warn!(
                    ticket = %action.position_ticket,
                    reason = result.reason.as_deref().unwrap_or("unknown"),
                    "reduce action failed"
                );
            }
        }

        let result = if netting.remaining_volume > LOT_TOLERANCE {
            // Residual goes to the broker under the original coid.
            let residual = OrderRequest {
                qty: netting.remaining_volume,
                ..request.clone()
            };

            match self.broker.place_order(&residual).await {
                Ok(result) => {
                    if result.accepted {
                        self.store
                            .record(
                                &coid,
                                result.broker_order_id.as_deref(),
                                &request.symbol,
                                request.side,
                                request.qty,
                            )
                            .await;
                        info!(
                            coid = %coid,
                            broker_order_id = result.broker_order_id.as_deref().unwrap_or("-"),
                            "order accepted and recorded"
                        );
                    } else {
                        // G3: rejection leaves the coid unrecorded.
                        warn!(
                            coid = %coid,
                            reason = result.reason.as_deref().unwrap_or("unknown"),
                            "order rejected by broker"
                        );
                    }
                    result
                }
                Err(e) => {
                    error!(coid = %coid, error = %e, "broker failure during residual submission");
                    OrderResult::rejected(broker_failure_reason(&e))
                }
            }
        } else {
            // Fully netted: no residual order, but the coid still burns.
            let synthetic = format!("NETTED_{coid}");
            self.store
                .record(&coid, Some(&synthetic), &request.symbol, request.side, request.qty)
                .await;
            OrderResult {
                accepted: true,
                broker_order_id: Some(synthetic),
                reason: Some("fully netted against existing positions".to_string()),
            }
        };

        metrics::histogram!("broker_latency_seconds", "symbol" => request.symbol.clone())
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Dispatch one reduce action: native close when the adapter supports
    /// it, otherwise an offsetting market order under a fresh `REDUCE_*` id.
    async fn execute_reduce(&self, request: &OrderRequest, action: &ReduceAction) -> OrderResult {
        match self
            .broker
            .close_position(&action.position_ticket, action.reduce_volume)
            .await
        {
            Ok(result) => result,
            Err(BrokerError::Unsupported { .. }) => {
                let reduce_coid = reduce_coid(&action.position_ticket, Utc::now());
                debug!(
                    ticket = %action.position_ticket,
                    coid = %reduce_coid,
                    "close_position unsupported; emitting offsetting market order"
                );
                let offsetting = OrderRequest::market(
                    reduce_coid,
                    request.symbol.clone(),
                    request.side,
                    action.reduce_volume,
                );
                match self.broker.place_order(&offsetting).await {
                    Ok(result) => result,
                    Err(e) => OrderResult::rejected(broker_failure_reason(&e)),
                }
            }
            Err(e) => OrderResult::rejected(broker_failure_reason(&e)),
        }
    }

    /// Existing broker positions for a symbol (the pipeline's open-position
    /// count input to the safety gate).
    pub async fn positions_for(&self, symbol: &str) -> Vec<Position> {
        self.broker.positions_for(symbol).await.unwrap_or_default()
    }
}

/// Fresh id for a reduce order: `REDUCE_<ticket>_<HHMMSS>`.
fn reduce_coid(ticket: &str, now: DateTime<Utc>) -> String {
    format!("REDUCE_{ticket}_{}", now.format("%H%M%S"))
}

fn broker_failure_reason(error: &BrokerError) -> String {
    match error {
        BrokerError::Unreachable(detail) => format!("BROKER_UNREACHABLE: {detail}"),
        other => format!("BROKER_ERROR: {other}"),
    }
}

impl std::fmt::Debug for IdempotentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotentExecutor")
            .field("mode", &self.aggregator.mode())
            .field("rule", &self.aggregator.rule())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::positions::{NettingMode, ReduceRule};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // ========================================================================
    // coid minting
    // ========================================================================

    #[test]
    fn coid_is_deterministic_24_hex() {
        let a = make_coid("XAUUSD", Side::Buy, "ma_cross", "20260302_1510");
        let b = make_coid("XAUUSD", Side::Buy, "ma_cross", "20260302_1510");
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn coid_varies_with_inputs() {
        let base = make_coid("XAUUSD", Side::Buy, "ma_cross", "20260302_1510");
        assert_ne!(base, make_coid("XAUUSD", Side::Sell, "ma_cross", "20260302_1510"));
        assert_ne!(base, make_coid("EURUSD", Side::Buy, "ma_cross", "20260302_1510"));
        assert_ne!(base, make_coid("XAUUSD", Side::Buy, "rsi", "20260302_1510"));
        assert_ne!(base, make_coid("XAUUSD", Side::Buy, "ma_cross", "20260302_1511"));
    }

    #[test]
    fn minute_bucket_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 10, 45).unwrap();
        assert_eq!(minute_bucket(now), "20260302_1510");
    }

    // ========================================================================
    // Counting broker for the at-most-once guarantee
    // ========================================================================

    /// Broker wrapper that counts `place_order` invocations.
    struct CountingBroker {
        inner: PaperBroker,
        place_calls: AtomicUsize,
        fail_next: Mutex<Option<BrokerError>>,
    }

    impl CountingBroker {
        fn new() -> Self {
            Self {
                inner: PaperBroker::new(dec!(10000)),
                place_calls: AtomicUsize::new(0),
                fail_next: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for CountingBroker {
        async fn connect(&self) -> Result<(), BrokerError> {
            self.inner.connect().await
        }
        async fn is_connected(&self) -> bool {
            self.inner.is_connected().await
        }
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, BrokerError> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_next.lock().unwrap().take() {
                return Err(err);
            }
            self.inner.place_order(request).await
        }
        async fn cancel(&self, id: &str) -> Result<bool, BrokerError> {
            self.inner.cancel(id).await
        }
        async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
            self.inner.positions().await
        }
        async fn close_position(
            &self,
            ticket: &str,
            volume: Decimal,
        ) -> Result<OrderResult, BrokerError> {
            self.inner.close_position(ticket, volume).await
        }
        async fn open_orders(&self) -> Result<Vec<crate::models::OpenOrder>, BrokerError> {
            self.inner.open_orders().await
        }
        async fn history_deals(
            &self,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
            symbol: &str,
        ) -> Result<Vec<crate::models::Deal>, BrokerError> {
            self.inner.history_deals(since, until, symbol).await
        }
        async fn symbol_info_tick(&self, symbol: &str) -> Result<crate::models::Tick, BrokerError> {
            self.inner.symbol_info_tick(symbol).await
        }
        async fn symbol_info(&self, symbol: &str) -> Result<crate::models::SymbolInfo, BrokerError> {
            self.inner.symbol_info(symbol).await
        }
        async fn account_equity(&self) -> Result<Decimal, BrokerError> {
            self.inner.account_equity().await
        }
        async fn atr(&self, s: &str, t: u32, p: u32) -> Result<Decimal, BrokerError> {
            self.inner.atr(s, t, p).await
        }
    }

    async fn executor_with(broker: Arc<CountingBroker>) -> IdempotentExecutor {
        broker.connect().await.unwrap();
        let store = Arc::new(IdempotencyStore::open_in_memory().await.unwrap());
        IdempotentExecutor::new(
            broker,
            store,
            PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo),
            false,
        )
    }

    fn request(coid: &str, side: Side, qty: Decimal) -> OrderRequest {
        OrderRequest::market(coid.to_string(), "XAUUSD".to_string(), side, qty)
    }

    #[tokio::test]
    async fn duplicate_coid_never_reaches_broker() {
        let broker = Arc::new(CountingBroker::new());
        let executor = executor_with(Arc::clone(&broker)).await;
        let req = request(&"a".repeat(24), Side::Buy, dec!(0.10));

        let first = executor.place(&req).await;
        assert!(first.accepted);
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 1);

        let second = executor.place(&req).await;
        assert!(!second.accepted);
        assert_eq!(second.reason.as_deref(), Some("DUPLICATE_COID"));
        // The broker saw exactly one call.
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broker_failure_leaves_coid_retryable() {
        let broker = Arc::new(CountingBroker::new());
        let executor = executor_with(Arc::clone(&broker)).await;
        let req = request(&"b".repeat(24), Side::Buy, dec!(0.10));

        *broker.fail_next.lock().unwrap() =
            Some(BrokerError::Unreachable("socket closed".to_string()));
        let failed = executor.place(&req).await;
        assert!(!failed.accepted);
        assert!(failed.reason.as_deref().unwrap().starts_with("BROKER_UNREACHABLE"));

        // Not recorded, so the same coid may retry and succeed.
        let retried = executor.place(&req).await;
        assert!(retried.accepted);
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn opposite_order_fully_netted_burns_coid() {
        let broker = Arc::new(CountingBroker::new());
        let executor = executor_with(Arc::clone(&broker)).await;

        // Open BUY 0.10, then SELL 0.10 nets flat with no new broker order.
        let open = request(&"c".repeat(24), Side::Buy, dec!(0.10));
        assert!(executor.place(&open).await.accepted);
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 1);

        let close = request(&"d".repeat(24), Side::Sell, dec!(0.10));
        let result = executor.place(&close).await;
        assert!(result.accepted);
        let id = result.broker_order_id.unwrap();
        assert!(id.starts_with("NETTED_"), "{id}");
        // Reduce went through close_position; no second place_order.
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 1);
        assert!(broker.inner.positions_for("XAUUSD").await.unwrap().is_empty());

        // The netted coid still dedups.
        let dup = executor.place(&close).await;
        assert_eq!(dup.reason.as_deref(), Some("DUPLICATE_COID"));
    }

    #[tokio::test]
    async fn residual_after_netting_goes_to_broker() {
        let broker = Arc::new(CountingBroker::new());
        let executor = executor_with(Arc::clone(&broker)).await;

        let open = request(&"e".repeat(24), Side::Buy, dec!(0.10));
        executor.place(&open).await;

        // SELL 0.30 closes the 0.10 long and opens SELL 0.20.
        let flip = request(&"f".repeat(24), Side::Sell, dec!(0.30));
        let result = executor.place(&flip).await;
        assert!(result.accepted);
        assert!(!result.broker_order_id.unwrap().starts_with("NETTED_"));

        let positions = broker.inner.positions_for("XAUUSD").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Sell);
        assert_eq!(positions[0].volume, dec!(0.20));
    }

    #[tokio::test]
    async fn dry_run_short_circuits_broker() {
        let broker = Arc::new(CountingBroker::new());
        broker.connect().await.unwrap();
        let store = Arc::new(IdempotencyStore::open_in_memory().await.unwrap());
        let executor = IdempotentExecutor::new(
            Arc::clone(&broker) as Arc<dyn BrokerGateway>,
            store,
            PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo),
            true,
        );

        let req = request(&"9".repeat(24), Side::Buy, dec!(0.10));
        let result = executor.place(&req).await;
        assert!(result.accepted);
        assert!(result.broker_order_id.unwrap().starts_with("DRYRUN_"));
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 0);

        let dup = executor.place(&req).await;
        assert_eq!(dup.reason.as_deref(), Some("DUPLICATE_COID"));
    }

    #[tokio::test]
    async fn invalid_request_rejected_without_broker_call() {
        let broker = Arc::new(CountingBroker::new());
        let executor = executor_with(Arc::clone(&broker)).await;

        let req = request(&"8".repeat(24), Side::Buy, dec!(0));
        let result = executor.place(&req).await;
        assert!(!result.accepted);
        assert!(result.reason.unwrap().starts_with("INVALID_REQUEST"));
        assert_eq!(broker.place_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reduce_coid_shape() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 10, 45).unwrap();
        assert_eq!(reduce_coid("P42", now), "REDUCE_P42_151045");
    }
}
