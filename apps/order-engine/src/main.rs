//! Order Engine Binary
//!
//! Starts the engine: load config, connect the selected broker adapter,
//! restore persistent state, wire the pipeline, and run until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin order-engine
//! ```
//!
//! # Environment Variables
//!
//! - `ORDER_ENGINE_CONFIG`: path to the YAML config (default: config.yaml)
//! - `RUST_LOG`: log filter (default: info)
//!
//! # Exit Codes
//!
//! - 0: normal shutdown
//! - 1: startup error (config, state stores)
//! - 2: broker unreachable

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use order_engine::alerts::{AlertLevel, AlertSink, TracingAlertSink};
use order_engine::broker::{BrokerGateway, Mt5BridgeBroker, PaperBroker};
use order_engine::bus::EventBus;
use order_engine::config::{load_config, BrokerKind, Config};
use order_engine::execution::{OrderBook, Reconciler};
use order_engine::idempotency::IdempotencyStore;
use order_engine::news::{NewsCalendar, NewsDisabled, TradingEconomicsCalendar};
use order_engine::pipeline::{Pipeline, TASK_CHART_RENDER, TASK_OPERATOR_ALERT};
use order_engine::positions::PositionAggregator;
use order_engine::risk::RiskGovernor;
use order_engine::runtime::{Runtime, WorkQueue};
use order_engine::safety::{LimitsManager, SafetyGate};
use order_engine::IdempotentExecutor;

/// Default starting balance for the paper adapter.
const PAPER_INITIAL_BALANCE: rust_decimal::Decimal = rust_decimal_macros::dec!(10000);

#[tokio::main]
async fn main() {
    // Static directive strings are guaranteed to parse successfully
    #[allow(clippy::unwrap_used)]
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("order_engine=info".parse().unwrap()),
        )
        .init();

    info!("starting order engine");

    let config_path = std::env::var("ORDER_ENGINE_CONFIG").ok();
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        broker = ?config.broker.kind,
        symbol = %config.trading.symbol,
        session = ?config.trading.session,
        dry_run = config.trading.dry_run,
        "configuration loaded"
    );

    let exit_code = run(config).await;
    std::process::exit(exit_code);
}

#[allow(clippy::too_many_lines)]
async fn run(config: Config) -> i32 {
    // Broker adapter.
    let broker: Arc<dyn BrokerGateway> = match config.broker.kind {
        BrokerKind::Paper => Arc::new(PaperBroker::new(PAPER_INITIAL_BALANCE)),
        BrokerKind::Mt5 => match Mt5BridgeBroker::new(&config.broker.mt5) {
            Ok(adapter) => Arc::new(adapter),
            Err(e) => {
                error!("failed to build MT5 bridge adapter: {e}");
                return 1;
            }
        },
    };

    if let Err(e) = broker.connect().await {
        error!("broker unreachable: {e}");
        return 2;
    }
    info!("broker connected");

    // Persistent state.
    let store = match IdempotencyStore::open(&config.persistence.db_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot open idempotency ledger: {e}");
            return 1;
        }
    };
    match store.purge_older_than(config.persistence.retention_days).await {
        Ok(0) => {}
        Ok(purged) => info!(purged, "purged expired ledger rows"),
        Err(e) => error!("ledger purge failed: {e}"),
    }

    let book = match OrderBook::open(store.database()).await {
        Ok(book) => Arc::new(book),
        Err(e) => {
            error!("cannot open order book: {e}");
            return 1;
        }
    };

    let governor = Arc::new(RiskGovernor::new(
        config.governor.clone(),
        chrono::Utc::now(),
    ));

    // News calendar.
    let calendar: Arc<dyn NewsCalendar> = if config.news.enabled {
        match TradingEconomicsCalendar::new(&config.news) {
            Ok(calendar) => Arc::new(calendar),
            Err(e) => {
                error!("failed to build news calendar: {e}");
                return 1;
            }
        }
    } else {
        Arc::new(NewsDisabled)
    };

    // Gate, executor, bus.
    let gate = SafetyGate::new(
        config.trading.clone(),
        config.news.clone(),
        LimitsManager::new(config.limits.clone()),
        calendar,
    );
    let executor = IdempotentExecutor::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        PositionAggregator::new(config.trading.netting_mode, config.trading.reduce_rule),
        config.trading.dry_run,
    );
    let bus = Arc::new(EventBus::new());
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&broker),
        Arc::clone(&bus),
        Arc::clone(&book),
        config.reconciler.clone(),
    ));

    // Sinks drain through the work queue; register handlers before start.
    let mut queue = WorkQueue::new();
    let alert_sink = Arc::new(TracingAlertSink);
    {
        let sink = Arc::clone(&alert_sink);
        queue.register(TASK_OPERATOR_ALERT, move |payload| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                let level = payload
                    .get("level")
                    .and_then(|v| serde_json::from_value::<AlertLevel>(v.clone()).ok())
                    .unwrap_or(AlertLevel::Info);
                let message = payload
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("(empty alert)");
                sink.notify(level, message).await;
                Ok(())
            })
        });
    }
    queue.register(TASK_CHART_RENDER, |payload| {
        Box::pin(async move {
            // Chart rendering lives outside the engine; log the request so
            // an attached renderer can be verified end to end.
            info!(request = %payload, "chart render requested");
            Ok(())
        })
    });

    let workers = config.runtime.workers;
    let mut runtime = Runtime::new();
    let queue_handle = runtime.start_workqueue(queue, workers);

    // Pipeline wiring happens before the reconciler can publish anything.
    let pipeline = Pipeline::new(
        config,
        Arc::clone(&bus),
        Arc::clone(&broker),
        executor,
        Arc::clone(&book),
        gate,
        governor,
        queue_handle,
    );
    pipeline.wire_handlers();
    runtime.start_reconciler(&reconciler);

    info!("order engine running; press ctrl-c to stop");

    if let Err(e) = signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    info!("shutdown signal received");
    runtime.shutdown().await;

    let stats = bus.stats();
    info!(
        events = stats.events_published,
        handler_errors = stats.handler_errors,
        "order engine stopped"
    );
    0
}
