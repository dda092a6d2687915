//! Pipeline orchestrator.
//!
//! Wires the handlers that carry a signal through the lifecycle:
//! `SignalDetected -> Validated -> RiskApproved -> OrderPlaced`, then hands
//! the order to the executor and waits on the reconciler for the fill. The
//! pipeline only ever talks to the bus, the executor, the governor, the
//! gate and the order book; sinks get their work through the queue.
//!
//! Handlers run on the publishing task; the only other publisher is the
//! reconciler, serialized through the bus gate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::alerts::AlertLevel;
use crate::broker::BrokerGateway;
use crate::bus::{EventBus, HandlerError};
use crate::config::Config;
use crate::events::{
    Event, EventKind, Filled, OrderPlaced, Rejected, RiskApproved, SignalDetected, TradeBlocked,
    TradeClosed, Validated,
};
use crate::execution::{make_coid, minute_bucket, wait_for_fill, IdempotentExecutor, OrderBook,
    OrderStatus};
use crate::models::OrderRequest;
use crate::news::NewsImpact;
use crate::risk::{lot_by_risk, sl_tp_by_atr, RiskGovernor};
use crate::runtime::WorkQueueHandle;
use crate::safety::{GateContext, SafetyGate};

/// Workqueue task name for operator alerts.
pub const TASK_OPERATOR_ALERT: &str = "operator_alert";
/// Workqueue task name for chart rendering.
pub const TASK_CHART_RENDER: &str = "chart_render";

/// Event-driven pipeline coordinator.
pub struct Pipeline {
    config: Config,
    bus: Arc<EventBus>,
    broker: Arc<dyn BrokerGateway>,
    executor: IdempotentExecutor,
    book: Arc<OrderBook>,
    gate: SafetyGate,
    governor: Arc<RiskGovernor>,
    queue: WorkQueueHandle,
    consecutive_timeouts: AtomicU32,
}

impl Pipeline {
    /// Build the pipeline. Call [`Pipeline::wire_handlers`] once before the
    /// runtime starts.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        bus: Arc<EventBus>,
        broker: Arc<dyn BrokerGateway>,
        executor: IdempotentExecutor,
        book: Arc<OrderBook>,
        gate: SafetyGate,
        governor: Arc<RiskGovernor>,
        queue: WorkQueueHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            broker,
            executor,
            book,
            gate,
            governor,
            queue,
            consecutive_timeouts: AtomicU32::new(0),
        })
    }

    /// Register every pipeline handler on the bus.
    pub fn wire_handlers(self: &Arc<Self>) {
        info!("wiring trading pipeline event handlers");

        let p = Arc::clone(self);
        self.bus
            .subscribe(EventKind::SignalDetected, "pipeline.signal", move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::SignalDetected(e) = event {
                        p.on_signal_detected(e).await?;
                    }
                    Ok(())
                })
            });

        let p = Arc::clone(self);
        self.bus
            .subscribe(EventKind::Validated, "pipeline.validated", move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::Validated(e) = event {
                        p.on_validated(e).await?;
                    }
                    Ok(())
                })
            });

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::RiskApproved,
            "pipeline.risk_approved",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::RiskApproved(e) = event {
                        p.on_risk_approved(e).await;
                    }
                    Ok(())
                })
            },
        );

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::OrderPlaced,
            "pipeline.order_placed",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::OrderPlaced(e) = event {
                        p.on_order_placed(e).await;
                    }
                    Ok(())
                })
            },
        );

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::TradeClosed,
            "pipeline.trade_closed",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::TradeClosed(e) = event {
                        p.on_trade_closed(&e);
                    }
                    Ok(())
                })
            },
        );

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::TradeBlocked,
            "pipeline.trade_blocked",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::TradeBlocked(e) = event {
                        p.on_trade_blocked(&e);
                    }
                    Ok(())
                })
            },
        );

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::CancelRequested,
            "pipeline.cancel_requested",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::CancelRequested(e) = event {
                        p.on_cancel_requested(&e).await?;
                    }
                    Ok(())
                })
            },
        );

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::StopUpdateRequested,
            "pipeline.stop_update",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::StopUpdateRequested(e) = event {
                        p.on_stop_update_requested(e).await?;
                    }
                    Ok(())
                })
            },
        );

        let p = Arc::clone(self);
        self.bus.subscribe(
            EventKind::ChartRequested,
            "pipeline.chart_requested",
            move |event| {
                let p = Arc::clone(&p);
                Box::pin(async move {
                    if let Event::ChartRequested(e) = event {
                        p.queue.submit(
                            TASK_CHART_RENDER,
                            json!({ "symbol": e.symbol, "timeframe_min": e.timeframe_min }),
                        );
                    }
                    Ok(())
                })
            },
        );

        info!("pipeline handlers registered");
    }

    /// Entry point for strategies: publish a signal under the bus gate.
    pub async fn submit_signal(&self, signal: SignalDetected) {
        self.bus
            .publish_guarded(Event::SignalDetected(signal))
            .await;
    }

    /// Forward a calendar event to the governor's news blackout.
    pub async fn apply_news_blackout(&self, impact: NewsImpact) {
        self.governor.apply_news_blackout(impact, Utc::now());
        metrics::counter!("news_blackouts_applied").increment(1);
        self.queue.submit(
            TASK_OPERATOR_ALERT,
            json!({
                "level": AlertLevel::Info,
                "message": format!("news blackout applied ({impact:?} impact)"),
            }),
        );
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Governor check, then the safety gate.
    async fn on_signal_detected(&self, event: SignalDetected) -> Result<(), HandlerError> {
        metrics::counter!(
            "signals_detected",
            "symbol" => event.symbol.clone(),
            "side" => event.side.as_str()
        )
        .increment(1);
        info!(
            symbol = %event.symbol,
            side = %event.side,
            strength = event.strength,
            "processing signal"
        );

        let now = Utc::now();
        let (can_trade, block_reason) = self.governor.can_trade(now);
        if !can_trade {
            warn!(reason = %block_reason, "trade blocked by risk governor");
            metrics::counter!("trades_blocked", "symbol" => event.symbol.clone()).increment(1);
            self.bus
                .publish(Event::TradeBlocked(TradeBlocked {
                    symbol: event.symbol,
                    side: event.side,
                    reason: block_reason,
                    ts: now,
                }))
                .await;
            return Ok(());
        }

        let equity = self
            .broker
            .account_equity()
            .await
            .map_err(|e| HandlerError::new("pipeline.signal", format!("equity fetch: {e}")))?;
        let open_positions = self.executor.positions_for(&event.symbol).await.len() as u32;
        let symbol_info = self
            .broker
            .symbol_info(&event.symbol)
            .await
            .map_err(|e| HandlerError::new("pipeline.signal", format!("symbol info: {e}")))?;

        let decision = self
            .gate
            .filter_decision(&GateContext {
                raw_side: event.side,
                close: event.close,
                ma_fast: event.ma_fast,
                ma_slow: event.ma_slow,
                rsi: event.rsi,
                atr: event.atr,
                equity,
                open_positions,
                symbol_info,
                last_trade_ts: self.governor.last_trade_ts(),
                now,
            })
            .await;

        if decision.is_hold() {
            metrics::counter!("signals_rejected", "symbol" => event.symbol.clone()).increment(1);
        } else {
            metrics::counter!("signals_validated", "symbol" => event.symbol.clone()).increment(1);
        }
        debug!(
            pass = !decision.is_hold(),
            reason = %decision.reason,
            "signal validation"
        );

        self.bus
            .publish(Event::Validated(Validated {
                symbol: event.symbol,
                side: event.side,
                reason: decision.is_hold().then(|| decision.reason.clone()),
                lot: decision.lot,
                sl_points: decision.sl_points,
                tp_points: decision.tp_points,
                atr: event.atr,
                strategy_id: event.strategy_id,
                ts: now,
            }))
            .await;
        Ok(())
    }

    /// Fetch market state and size the approved trade.
    async fn on_validated(&self, event: Validated) -> Result<(), HandlerError> {
        if !event.is_valid() {
            debug!(reason = ?event.reason, "skipping invalid signal");
            return Ok(());
        }

        info!(symbol = %event.symbol, side = %event.side, "processing validated signal");

        let tick = self
            .broker
            .symbol_info_tick(&event.symbol)
            .await
            .map_err(|e| HandlerError::new("pipeline.validated", format!("tick fetch: {e}")))?;
        let price = tick.price_for(event.side);

        // Broker ATR is authoritative for stop placement; the signal's own
        // reading is the fallback.
        let atr = match self
            .broker
            .atr(
                &event.symbol,
                self.config.trading.timeframe_min,
                self.config.trading.atr_period,
            )
            .await
        {
            Ok(atr) => atr,
            Err(e) => {
                warn!(error = %e, "ATR fetch failed; using signal ATR");
                event.atr
            }
        };

        let (sl, tp) = sl_tp_by_atr(
            event.side,
            price,
            atr,
            self.config.trading.sl_mult,
            self.config.trading.tp_mult,
        );

        let equity = self
            .broker
            .account_equity()
            .await
            .map_err(|e| HandlerError::new("pipeline.validated", format!("equity fetch: {e}")))?;
        let symbol_info = self
            .broker
            .symbol_info(&event.symbol)
            .await
            .map_err(|e| HandlerError::new("pipeline.validated", format!("symbol info: {e}")))?;

        let qty = lot_by_risk(&symbol_info, price, sl, equity, self.config.trading.risk_pct);

        info!(
            %equity,
            %atr,
            %qty,
            %sl,
            %tp,
            "risk sizing complete"
        );

        self.bus
            .publish(Event::RiskApproved(RiskApproved {
                symbol: event.symbol,
                side: event.side,
                qty,
                sl,
                tp,
                strategy_id: event.strategy_id,
                ts: Utc::now(),
            }))
            .await;
        Ok(())
    }

    /// Mint the deterministic client order id and hand off to placement.
    async fn on_risk_approved(&self, event: RiskApproved) {
        let bucket = minute_bucket(Utc::now());
        let coid = make_coid(&event.symbol, event.side, &event.strategy_id, &bucket);
        debug!(%coid, bucket, "client order id minted");

        self.bus
            .publish(Event::OrderPlaced(OrderPlaced {
                client_order_id: coid,
                symbol: event.symbol,
                side: event.side,
                qty: event.qty,
                sl: Some(event.sl),
                tp: Some(event.tp),
                ts: Utc::now(),
            }))
            .await;
    }

    /// Execute through the idempotent executor and reconcile the fill.
    async fn on_order_placed(&self, event: OrderPlaced) {
        let started = Instant::now();
        let coid = event.client_order_id.clone();
        metrics::counter!(
            "orders_placed",
            "symbol" => event.symbol.clone(),
            "side" => event.side.as_str()
        )
        .increment(1);

        let request = OrderRequest::market(
            coid.clone(),
            event.symbol.clone(),
            event.side,
            event.qty,
        )
        .with_stops(event.sl, event.tp);

        let result = self.executor.place(&request).await;
        let broker_latency = started.elapsed();
        info!(
            %coid,
            accepted = result.accepted,
            broker_order_id = result.broker_order_id.as_deref().unwrap_or("-"),
            reason = result.reason.as_deref().unwrap_or("-"),
            latency_ms = broker_latency.as_millis() as u64,
            "broker response"
        );

        if !result.accepted {
            metrics::counter!("orders_rejected", "symbol" => event.symbol.clone()).increment(1);
            let reason = result
                .reason
                .unwrap_or_else(|| "unknown rejection".to_string());
            if reason.starts_with("BROKER_UNREACHABLE") {
                self.queue.submit(
                    TASK_OPERATOR_ALERT,
                    json!({
                        "level": AlertLevel::Critical,
                        "message": format!("broker unreachable while placing {coid}: {reason}"),
                    }),
                );
            }
            self.bus
                .publish(Event::Rejected(Rejected {
                    client_order_id: coid,
                    reason,
                    ts: Utc::now(),
                }))
                .await;
            return;
        }

        metrics::counter!("orders_accepted", "symbol" => event.symbol.clone()).increment(1);
        let broker_order_id = result.broker_order_id.unwrap_or_default();
        let synthetic =
            broker_order_id.starts_with("NETTED_") || broker_order_id.starts_with("DRYRUN_");

        self.book
            .upsert_on_accept(
                &coid,
                &event.symbol,
                event.side,
                event.qty,
                Some(&broker_order_id),
                event.sl,
                event.tp,
                OrderStatus::Accepted,
            )
            .await;

        let now = Utc::now();
        self.gate.limits().mark_trade(&event.symbol, now);
        self.governor.record_trade(now);

        if synthetic {
            // Netted or dry-run submissions produce no venue deal; complete
            // the record locally and emit the fill here.
            self.complete_synthetic_fill(&event, &coid, &broker_order_id)
                .await;
            return;
        }

        // Real submission: the reconciler owns fill detection and event
        // emission; wait for the book to reflect it.
        let reconciliation_started = Instant::now();
        let (filled, _ticket) = wait_for_fill(
            &self.book,
            &coid,
            Duration::from_secs_f64(self.config.reconciler.fill_timeout_sec),
            Duration::from_secs_f64(self.config.reconciler.fill_poll_sec),
        )
        .await;

        let reconciliation_latency = reconciliation_started.elapsed();
        metrics::histogram!("reconciliation_latency_seconds", "symbol" => event.symbol.clone())
            .record(reconciliation_latency.as_secs_f64());
        metrics::histogram!("total_latency_seconds", "symbol" => event.symbol.clone())
            .record(started.elapsed().as_secs_f64());

        if filled {
            self.consecutive_timeouts.store(0, Ordering::Relaxed);
            metrics::counter!("orders_filled", "symbol" => event.symbol.clone()).increment(1);
            info!(
                %coid,
                reconciliation_ms = reconciliation_latency.as_millis() as u64,
                total_ms = started.elapsed().as_millis() as u64,
                "order filled"
            );
        } else {
            metrics::counter!("orders_timeout", "symbol" => event.symbol.clone()).increment(1);
            let streak = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(%coid, streak, "reconciliation timeout; emitting Rejected");

            if streak >= self.config.reconciler.timeout_alert_threshold {
                self.queue.submit(
                    TASK_OPERATOR_ALERT,
                    json!({
                        "level": AlertLevel::Warning,
                        "message": format!(
                            "{streak} consecutive reconciliation timeouts (latest: {coid})"
                        ),
                    }),
                );
            }

            self.bus
                .publish(Event::Rejected(Rejected {
                    client_order_id: coid,
                    reason: format!(
                        "RECONCILIATION_TIMEOUT after {:.3}s",
                        reconciliation_latency.as_secs_f64()
                    ),
                    ts: Utc::now(),
                }))
                .await;
        }
    }

    /// Complete a netted or dry-run order locally and publish its fill.
    async fn complete_synthetic_fill(&self, event: &OrderPlaced, coid: &str, broker_id: &str) {
        let price = match self.broker.symbol_info_tick(&event.symbol).await {
            Ok(tick) => {
                metrics::counter!("fill_price_fallbacks", "fallback" => "market_price")
                    .increment(1);
                tick.price_for(event.side)
            }
            Err(e) => {
                metrics::counter!("fill_price_fallbacks", "fallback" => "placeholder")
                    .increment(1);
                warn!(%coid, error = %e, "no price source for synthetic fill; using placeholder");
                Decimal::ZERO
            }
        };

        if let Err(e) = self.book.mark_partial(coid, event.qty, price).await {
            warn!(%coid, error = %e, "failed to complete synthetic fill in order book");
        }

        self.bus
            .publish(Event::Filled(Filled {
                client_order_id: coid.to_string(),
                broker_order_id: broker_id.to_string(),
                symbol: event.symbol.clone(),
                side: event.side,
                qty: event.qty,
                price,
                deal_ticket: None,
                ts: Utc::now(),
            }))
            .await;
    }

    /// Forward a cancel request to the venue.
    ///
    /// The reconciler observes the order disappearing and emits `Cancelled`;
    /// this handler only asks the broker.
    async fn on_cancel_requested(
        &self,
        event: &crate::events::CancelRequested,
    ) -> Result<(), HandlerError> {
        let coid = &event.client_order_id;
        let Some(record) = self.book.get(coid) else {
            warn!(%coid, "cancel requested for unknown order");
            return Ok(());
        };
        let Some(broker_id) = record.broker_order_id else {
            warn!(%coid, "cancel requested before broker acknowledgment");
            return Ok(());
        };

        match self.broker.cancel(&broker_id).await {
            Ok(cancelled) => {
                info!(%coid, %broker_id, cancelled, "cancel request forwarded");
                Ok(())
            }
            Err(e) => Err(HandlerError::new(
                "pipeline.cancel_requested",
                format!("cancel {coid}: {e}"),
            )),
        }
    }

    /// Apply a stop modification to the local record and confirm it.
    async fn on_stop_update_requested(
        &self,
        event: crate::events::StopUpdateRequested,
    ) -> Result<(), HandlerError> {
        match self
            .book
            .update_stops(&event.client_order_id, event.sl, event.tp)
            .await
        {
            Ok(record) => {
                info!(
                    coid = %record.coid,
                    sl = ?record.sl,
                    tp = ?record.tp,
                    "stops updated"
                );
                self.bus
                    .publish(Event::StopUpdated(crate::events::StopUpdated {
                        client_order_id: record.coid,
                        sl: record.sl,
                        tp: record.tp,
                        ts: Utc::now(),
                    }))
                    .await;
                Ok(())
            }
            Err(e) => Err(HandlerError::new(
                "pipeline.stop_update",
                format!("stop update {}: {e}", event.client_order_id),
            )),
        }
    }

    /// Feed the realized result back into the governor.
    fn on_trade_closed(&self, event: &TradeClosed) {
        self.governor.on_trade_closed(event.pnl, Utc::now());

        let outcome = if event.pnl > Decimal::ZERO { "win" } else { "loss" };
        metrics::counter!("trades_closed", "result" => outcome).increment(1);
        if let Some(pnl) = event.pnl.to_f64() {
            metrics::histogram!("trade_pnl").record(pnl);
        }

        info!(
            symbol = %event.symbol,
            pnl = %event.pnl,
            close_reason = event.close_reason.as_deref().unwrap_or("-"),
            "trade closed"
        );
    }

    /// Raise an operator alert for a governor block.
    fn on_trade_blocked(&self, event: &TradeBlocked) {
        warn!(
            symbol = %event.symbol,
            side = %event.side,
            reason = %event.reason,
            "trade blocked"
        );
        self.queue.submit(
            TASK_OPERATOR_ALERT,
            json!({
                "level": AlertLevel::Warning,
                "message": format!(
                    "risk block: {} ({} {})",
                    event.reason, event.symbol, event.side
                ),
            }),
        );
    }

    /// Snapshot used by operators and tests.
    #[must_use]
    pub fn governor(&self) -> &Arc<RiskGovernor> {
        &self.governor
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("symbol", &self.config.trading.symbol)
            .finish_non_exhaustive()
    }
}
