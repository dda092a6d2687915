//! End-to-end pipeline tests against the paper broker.
//!
//! Drives real signals through governor, gate, sizing, the idempotent
//! executor and the background reconciler, and asserts on the events that
//! come out the other side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use order_engine::broker::{BrokerError, BrokerGateway, PaperBroker};
use order_engine::bus::EventBus;
use order_engine::config::{Config, GovernorConfig, LimitsConfig, ReconcilerConfig, TradingConfig};
use order_engine::events::{Event, EventKind, SignalDetected};
use order_engine::execution::{OrderBook, Reconciler};
use order_engine::idempotency::IdempotencyStore;
use order_engine::models::{
    Deal, OpenOrder, OrderRequest, OrderResult, Position, Side, SymbolInfo, Tick,
};
use order_engine::news::NewsDisabled;
use order_engine::pipeline::{Pipeline, TASK_OPERATOR_ALERT};
use order_engine::positions::PositionAggregator;
use order_engine::risk::RiskGovernor;
use order_engine::runtime::{Runtime, WorkQueue};
use order_engine::safety::{LimitsManager, SafetyGate};
use order_engine::{IdempotentExecutor, NettingMode, ReduceRule};

// ============================================================================
// Harness
// ============================================================================

struct Captured {
    filled: Arc<Mutex<Vec<order_engine::events::Filled>>>,
    rejected: Arc<Mutex<Vec<order_engine::events::Rejected>>>,
    blocked: Arc<Mutex<Vec<order_engine::events::TradeBlocked>>>,
    order_placed: Arc<Mutex<Vec<order_engine::events::OrderPlaced>>>,
    alerts: Arc<Mutex<Vec<String>>>,
}

struct Engine {
    pipeline: Arc<Pipeline>,
    bus: Arc<EventBus>,
    book: Arc<OrderBook>,
    runtime: Runtime,
    captured: Captured,
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        trading: TradingConfig {
            // No cooldown so back-to-back signals reach the executor.
            cooldown_mult: dec!(0),
            ..TradingConfig::default()
        },
        limits: LimitsConfig {
            max_open_positions: 10,
            max_trades_per_day: 20,
            state_path: dir
                .path()
                .join("limits.json")
                .to_str()
                .unwrap()
                .to_string(),
            ..LimitsConfig::default()
        },
        governor: GovernorConfig {
            session_limit: 20,
            ..GovernorConfig::default()
        },
        reconciler: ReconcilerConfig {
            poll_sec: 0.05,
            fill_timeout_sec: 2.0,
            fill_poll_sec: 0.02,
            timeout_alert_threshold: 1,
            ..ReconcilerConfig::default()
        },
        ..Config::default()
    }
}

async fn build_engine(broker: Arc<dyn BrokerGateway>, config: Config) -> Engine {
    broker.connect().await.expect("broker connect");

    let bus = Arc::new(EventBus::new());
    let book = Arc::new(OrderBook::in_memory());
    let store = Arc::new(IdempotencyStore::open_in_memory().await.unwrap());

    let governor = Arc::new(RiskGovernor::in_memory(config.governor.clone(), Utc::now()));
    let gate = SafetyGate::new(
        config.trading.clone(),
        config.news.clone(),
        LimitsManager::new(config.limits.clone()),
        Arc::new(NewsDisabled),
    );
    let executor = IdempotentExecutor::new(
        Arc::clone(&broker),
        store,
        PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo),
        false,
    );
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&broker),
        Arc::clone(&bus),
        Arc::clone(&book),
        config.reconciler.clone(),
    ));

    // Capture the alert tasks the pipeline submits.
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let mut queue = WorkQueue::new();
    {
        let sink = Arc::clone(&alerts);
        queue.register(TASK_OPERATOR_ALERT, move |payload| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                let message = payload
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                sink.lock().unwrap().push(message);
                Ok(())
            })
        });
    }

    let mut runtime = Runtime::new();
    let queue_handle = runtime.start_workqueue(queue, 1);

    let pipeline = Pipeline::new(
        config,
        Arc::clone(&bus),
        broker,
        executor,
        Arc::clone(&book),
        gate,
        governor,
        queue_handle,
    );
    pipeline.wire_handlers();

    // Event collectors register after the pipeline so they observe the
    // final shape of each cascade.
    let captured = Captured {
        filled: collect(&bus, EventKind::Filled, |e| match e {
            Event::Filled(x) => Some(x),
            _ => None,
        }),
        rejected: collect(&bus, EventKind::Rejected, |e| match e {
            Event::Rejected(x) => Some(x),
            _ => None,
        }),
        blocked: collect(&bus, EventKind::TradeBlocked, |e| match e {
            Event::TradeBlocked(x) => Some(x),
            _ => None,
        }),
        order_placed: collect(&bus, EventKind::OrderPlaced, |e| match e {
            Event::OrderPlaced(x) => Some(x),
            _ => None,
        }),
        alerts,
    };

    runtime.start_reconciler(&reconciler);

    Engine {
        pipeline,
        bus,
        book,
        runtime,
        captured,
    }
}

fn collect<T: Send + 'static>(
    bus: &EventBus,
    kind: EventKind,
    extract: fn(Event) -> Option<T>,
) -> Arc<Mutex<Vec<T>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    bus.subscribe(kind, "test.collector", move |event| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            if let Some(payload) = extract(event) {
                sink.lock().unwrap().push(payload);
            }
            Ok(())
        })
    });
    collected
}

fn buy_signal(symbol: &str) -> SignalDetected {
    SignalDetected {
        symbol: symbol.to_string(),
        side: Side::Buy,
        strength: 0.85,
        strategy_id: "ma_cross".to_string(),
        close: dec!(2500),
        ma_fast: dec!(2499),
        ma_slow: dec!(2495),
        rsi: 55.0,
        atr: dec!(2.0),
        ts: Utc::now(),
    }
}

/// Avoid minting coids across a minute boundary mid-test.
async fn settle_minute_boundary() {
    use chrono::Timelike;
    if Utc::now().second() >= 57 {
        tokio::time::sleep(Duration::from_secs(4)).await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn signal_flows_to_filled_order() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(PaperBroker::new(dec!(10000)));
    let engine = build_engine(broker, test_config(&dir)).await;

    engine.pipeline.submit_signal(buy_signal("XAUUSD")).await;

    // The fill event arrives from the reconciler once the pipeline cascade
    // releases the bus gate.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let placed = engine.captured.order_placed.lock().unwrap().clone();
    assert_eq!(placed.len(), 1);
    let coid = placed[0].client_order_id.clone();
    assert_eq!(coid.len(), 24);

    let filled = engine.captured.filled.lock().unwrap();
    assert_eq!(filled.len(), 1, "expected exactly one Filled event");
    assert_eq!(filled[0].client_order_id, coid);
    assert_eq!(filled[0].qty, dec!(0.33));
    // Paper fills at ask plus slippage.
    assert_eq!(filled[0].price, dec!(2500.82));

    let record = engine.book.get(&coid).expect("book record");
    assert_eq!(record.status, order_engine::OrderStatus::Filled);
    assert_eq!(record.filled_qty, dec!(0.33));
    assert_eq!(record.filled_qty + record.remaining_qty, record.qty);

    assert_eq!(engine.pipeline.governor().state_summary().trades_today, 1);
    engine.runtime.shutdown().await;
}

#[tokio::test]
async fn duplicate_signal_in_same_minute_is_deduplicated() {
    settle_minute_boundary().await;

    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(CountingBroker::new());
    let engine = build_engine(
        Arc::clone(&broker) as Arc<dyn BrokerGateway>,
        test_config(&dir),
    )
    .await;

    engine.pipeline.submit_signal(buy_signal("XAUUSD")).await;
    engine.pipeline.submit_signal(buy_signal("XAUUSD")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let placed = engine.captured.order_placed.lock().unwrap().clone();
    assert_eq!(placed.len(), 2);
    assert_eq!(
        placed[0].client_order_id, placed[1].client_order_id,
        "same minute bucket must mint the same coid"
    );

    // Exactly one submission reached the broker; the second came back as a
    // duplicate.
    assert_eq!(broker.place_calls.load(Ordering::SeqCst), 1);
    let rejected = engine.captured.rejected.lock().unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].reason.contains("DUPLICATE_COID"));

    // One order book record.
    assert_eq!(engine.book.count(), 1);
    engine.runtime.shutdown().await;
}

#[tokio::test]
async fn governor_block_publishes_trade_blocked_and_alert() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.governor.session_limit = 0;

    let broker = Arc::new(PaperBroker::new(dec!(10000)));
    let engine = build_engine(broker, config).await;

    engine.pipeline.submit_signal(buy_signal("XAUUSD")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let blocked = engine.captured.blocked.lock().unwrap();
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0].reason.contains("session_budget"));

    // The blocked trade produced no order and an operator alert.
    assert!(engine.captured.order_placed.lock().unwrap().is_empty());
    let alerts = engine.captured.alerts.lock().unwrap();
    assert!(alerts.iter().any(|m| m.contains("risk block")), "{alerts:?}");
    engine.runtime.shutdown().await;
}

#[tokio::test]
async fn silent_broker_causes_reconciliation_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.reconciler.fill_timeout_sec = 0.2;

    let broker = Arc::new(SilentBroker::default());
    let engine = build_engine(broker, config).await;

    engine.pipeline.submit_signal(buy_signal("XAUUSD")).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let rejected = engine.captured.rejected.lock().unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(
        rejected[0].reason.starts_with("RECONCILIATION_TIMEOUT"),
        "{}",
        rejected[0].reason
    );
    assert!(engine.captured.filled.lock().unwrap().is_empty());

    // One consecutive timeout with threshold 1 raises the operator alert.
    let alerts = engine.captured.alerts.lock().unwrap();
    assert!(
        alerts.iter().any(|m| m.contains("reconciliation timeout")),
        "{alerts:?}"
    );
    engine.runtime.shutdown().await;
}

#[tokio::test]
async fn bus_reports_pipeline_stats() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(PaperBroker::new(dec!(10000)));
    let engine = build_engine(broker, test_config(&dir)).await;

    engine.pipeline.submit_signal(buy_signal("XAUUSD")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = engine.bus.stats();
    // SignalDetected, Validated, RiskApproved, OrderPlaced, Filled at
    // minimum.
    assert!(stats.events_published >= 5, "{stats:?}");
    assert_eq!(stats.handler_errors, 0);
    engine.runtime.shutdown().await;
}

// ============================================================================
// Test brokers
// ============================================================================

/// Paper broker wrapper counting `place_order` calls.
struct CountingBroker {
    inner: PaperBroker,
    place_calls: AtomicUsize,
}

impl CountingBroker {
    fn new() -> Self {
        Self {
            inner: PaperBroker::new(dec!(10000)),
            place_calls: AtomicUsize::new(0),
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
        self.inner.place_order(request).await
    }
    async fn cancel(&self, id: &str) -> Result<bool, BrokerError> {
        self.inner.cancel(id).await
    }
    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.inner.positions().await
    }
    async fn close_position(&self, t: &str, v: Decimal) -> Result<OrderResult, BrokerError> {
        self.inner.close_position(t, v).await
    }
    async fn open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        self.inner.open_orders().await
    }
    async fn history_deals(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        symbol: &str,
    ) -> Result<Vec<Deal>, BrokerError> {
        self.inner.history_deals(since, until, symbol).await
    }
    async fn symbol_info_tick(&self, symbol: &str) -> Result<Tick, BrokerError> {
        self.inner.symbol_info_tick(symbol).await
    }
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        self.inner.symbol_info(symbol).await
    }
    async fn account_equity(&self) -> Result<Decimal, BrokerError> {
        self.inner.account_equity().await
    }
    async fn atr(&self, s: &str, t: u32, p: u32) -> Result<Decimal, BrokerError> {
        self.inner.atr(s, t, p).await
    }
}

/// Broker that accepts every order but never reports a deal, position, or
/// open order: every fill wait must time out.
#[derive(Default)]
struct SilentBroker {
    next_ticket: AtomicUsize,
}

#[async_trait]
impl BrokerGateway for SilentBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        true
    }
    async fn place_order(&self, _request: &OrderRequest) -> Result<OrderResult, BrokerError> {
        let n = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        Ok(OrderResult::accepted(format!("S{n}")))
    }
    async fn cancel(&self, _: &str) -> Result<bool, BrokerError> {
        Ok(false)
    }
    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(Vec::new())
    }
    async fn open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        Ok(Vec::new())
    }
    async fn history_deals(
        &self,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
        _symbol: &str,
    ) -> Result<Vec<Deal>, BrokerError> {
        Ok(Vec::new())
    }
    async fn symbol_info_tick(&self, _: &str) -> Result<Tick, BrokerError> {
        Ok(Tick {
            bid: dec!(2500.50),
            ask: dec!(2500.80),
        })
    }
    async fn symbol_info(&self, _: &str) -> Result<SymbolInfo, BrokerError> {
        Ok(SymbolInfo {
            tick_size: dec!(0.01),
            tick_value: dec!(1.0),
            volume_min: dec!(0.01),
            volume_max: dec!(100.0),
            volume_step: dec!(0.01),
        })
    }
    async fn account_equity(&self) -> Result<Decimal, BrokerError> {
        Ok(dec!(10000))
    }
    async fn atr(&self, _: &str, _: u32, _: u32) -> Result<Decimal, BrokerError> {
        Ok(dec!(2.0))
    }
}
