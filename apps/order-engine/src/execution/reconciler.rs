//! Broker reconciliation.
//!
//! A dedicated background task replays the venue's deal history against the
//! local order book on a fixed interval, applying fills, activating pending
//! orders, and detecting orders that vanished from the venue. Lifecycle
//! events (`PartiallyFilled`, `Filled`, `PendingActivated`, `Cancelled`)
//! are published from here and only here, exactly one event per matched
//! deal, under the bus gate so they serialize with the pipeline's own
//! event streams.
//!
//! Broker failures inside the loop are logged and the loop continues on the
//! next tick. The task stops promptly when the shutdown channel fires.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerGateway;
use crate::bus::EventBus;
use crate::config::ReconcilerConfig;
use crate::events::{Cancelled, Event, Filled, PartiallyFilled, PendingActivated};
use crate::execution::order_book::{OrderBook, OrderRecord, OrderStatus};
use crate::models::Deal;

/// Soft cap on the processed-deal set; above this the set is cleared.
const PROCESSED_DEALS_CAP: usize = 10_000;

/// Background deal-history poller.
pub struct Reconciler {
    broker: Arc<dyn BrokerGateway>,
    bus: Arc<EventBus>,
    book: Arc<OrderBook>,
    config: ReconcilerConfig,
    processed_deals: Mutex<HashSet<String>>,
}

impl Reconciler {
    /// Build a reconciler over the shared order book.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        bus: Arc<EventBus>,
        book: Arc<OrderBook>,
        config: ReconcilerConfig,
    ) -> Self {
        info!(poll_sec = config.poll_sec, "reconciliation engine initialized");
        Self {
            broker,
            bus,
            book,
            config,
            processed_deals: Mutex::new(HashSet::new()),
        }
    }

    /// Start the background loop. The task exits when `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs_f64(this.config.poll_sec));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("reconciliation loop started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => this.tick().await,
                }
            }

            info!("reconciliation loop stopped");
        })
    }

    /// One reconciliation pass.
    async fn tick(&self) {
        self.reconcile_deals().await;
        self.process_pending_activations().await;
        self.detect_cancellations().await;
        self.cleanup().await;
    }

    /// Match recent deals against active orders and apply fills.
    async fn reconcile_deals(&self) {
        let active = self.book.get_active_orders();
        if active.is_empty() {
            return;
        }

        let since = Utc::now()
            - chrono::Duration::hours(i64::from(self.config.history_window_hours));
        let until = Utc::now();

        let symbols: BTreeSet<String> = active.iter().map(|o| o.symbol.clone()).collect();
        for symbol in symbols {
            let deals = match self.broker.history_deals(since, until, &symbol).await {
                Ok(deals) => deals,
                Err(e) => {
                    warn!(symbol, error = %e, "deal history fetch failed; retrying next tick");
                    continue;
                }
            };

            for deal in deals {
                self.process_deal(&deal, &active).await;
            }
        }
    }

    /// Apply one deal to the first matching active order.
    async fn process_deal(&self, deal: &Deal, active: &[OrderRecord]) {
        if deal.comment.is_empty() {
            return;
        }

        {
            let Ok(processed) = self.processed_deals.lock() else {
                return;
            };
            if processed.contains(&deal.ticket) {
                return;
            }
        }

        // Exact match first, then prefix (brokers may append text to the
        // comment). First match in active-order iteration order wins.
        let matching = active.iter().find(|order| {
            deal.comment == order.coid || deal.comment.starts_with(&order.coid)
        });
        let Some(order) = matching else { return };

        if let Ok(mut processed) = self.processed_deals.lock() {
            processed.insert(deal.ticket.clone());
        }

        let updated = match self
            .book
            .mark_partial(&order.coid, deal.volume, deal.price)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(
                    deal_ticket = %deal.ticket,
                    coid = %order.coid,
                    error = %e,
                    "failed to apply deal to order book"
                );
                return;
            }
        };

        metrics::counter!("reconciler_deals_processed", "symbol" => deal.symbol.clone())
            .increment(1);

        if updated.status == OrderStatus::Filled {
            info!(
                coid = %updated.coid,
                price = %updated.avg_fill_price,
                deal_ticket = %deal.ticket,
                "order fully filled"
            );
            self.bus
                .publish_guarded(Event::Filled(Filled {
                    client_order_id: updated.coid.clone(),
                    broker_order_id: updated
                        .broker_order_id
                        .clone()
                        .unwrap_or_else(|| deal.ticket.clone()),
                    symbol: updated.symbol.clone(),
                    side: updated.side,
                    qty: updated.qty,
                    price: updated.avg_fill_price,
                    deal_ticket: Some(deal.ticket.clone()),
                    ts: deal.time,
                }))
                .await;
        } else {
            info!(
                coid = %updated.coid,
                fill_qty = %deal.volume,
                fill_price = %deal.price,
                filled = %updated.filled_qty,
                total = %updated.qty,
                "partial fill"
            );
            self.bus
                .publish_guarded(Event::PartiallyFilled(PartiallyFilled {
                    client_order_id: updated.coid.clone(),
                    symbol: updated.symbol.clone(),
                    side: updated.side,
                    fill_qty: deal.volume,
                    fill_price: deal.price,
                    total_filled: updated.filled_qty,
                    remaining_qty: updated.remaining_qty,
                    avg_fill_price: updated.avg_fill_price,
                    deal_ticket: deal.ticket.clone(),
                    ts: deal.time,
                }))
                .await;
        }
    }

    /// Promote pending orders whose comment shows up at the venue.
    async fn process_pending_activations(&self) {
        let pending: Vec<OrderRecord> = self
            .book
            .get_active_orders()
            .into_iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .collect();
        if pending.is_empty() {
            return;
        }

        let positions = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "positions fetch failed during pending activation");
                return;
            }
        };
        let orders = match self.broker.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "open orders fetch failed during pending activation");
                return;
            }
        };

        // Comment -> broker ticket; positions first (market orders that
        // executed immediately), then resting orders.
        let mut broker_map: HashMap<String, String> = HashMap::new();
        for position in positions {
            if !position.comment.is_empty() {
                broker_map.insert(position.comment, position.ticket);
            }
        }
        for order in orders {
            if !order.comment.is_empty() {
                broker_map.insert(order.comment, order.ticket);
            }
        }

        for record in pending {
            let Some(broker_id) = broker_map.get(&record.coid).cloned() else {
                continue;
            };

            self.book
                .upsert_on_accept(
                    &record.coid,
                    &record.symbol,
                    record.side,
                    record.qty,
                    Some(&broker_id),
                    record.sl,
                    record.tp,
                    OrderStatus::Accepted,
                )
                .await;

            info!(coid = %record.coid, broker_id = %broker_id, "pending order activated");
            self.bus
                .publish_guarded(Event::PendingActivated(PendingActivated {
                    client_order_id: record.coid.clone(),
                    broker_order_id: broker_id,
                    symbol: record.symbol.clone(),
                    side: record.side,
                    qty: record.qty,
                    ts: Utc::now(),
                }))
                .await;
        }
    }

    /// Cancel orders whose broker id disappeared from the venue.
    ///
    /// Skipped entirely when either venue query fails: a transient fetch
    /// error must not read as a mass cancellation.
    async fn detect_cancellations(&self) {
        let working: Vec<OrderRecord> = self
            .book
            .get_active_orders()
            .into_iter()
            .filter(|o| {
                matches!(o.status, OrderStatus::Accepted | OrderStatus::Partial)
                    && o.broker_order_id.is_some()
            })
            .collect();
        if working.is_empty() {
            return;
        }

        let positions = match self.broker.positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "positions fetch failed; skipping cancellation sweep");
                return;
            }
        };
        let orders = match self.broker.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "open orders fetch failed; skipping cancellation sweep");
                return;
            }
        };

        let mut live_ids: HashSet<String> = positions.into_iter().map(|p| p.ticket).collect();
        live_ids.extend(orders.into_iter().map(|o| o.ticket));

        for record in working {
            let Some(broker_id) = &record.broker_order_id else {
                continue;
            };
            if live_ids.contains(broker_id) {
                continue;
            }

            match self.book.mark_cancelled(&record.coid).await {
                Ok(_) => {
                    info!(coid = %record.coid, "order cancelled (vanished from broker)");
                    metrics::counter!("reconciler_cancellations").increment(1);
                    self.bus
                        .publish_guarded(Event::Cancelled(Cancelled {
                            client_order_id: record.coid.clone(),
                            symbol: record.symbol.clone(),
                            reason: "broker cancellation detected".to_string(),
                            ts: Utc::now(),
                        }))
                        .await;
                }
                Err(e) => debug!(coid = %record.coid, error = %e, "cancellation race"),
            }
        }
    }

    /// Bound memory: trim terminal orders and the processed-deal set.
    async fn cleanup(&self) {
        let max_age = chrono::Duration::hours(i64::from(self.config.cleanup_max_age_hours));
        let removed = self.book.cleanup_old_orders(max_age).await;
        if removed > 0 {
            debug!(removed, "cleaned up terminal orders");
        }

        if let Ok(mut processed) = self.processed_deals.lock() {
            if processed.len() > PROCESSED_DEALS_CAP {
                processed.clear();
                info!("cleared processed deals cache (size cap)");
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("poll_sec", &self.config.poll_sec)
            .finish_non_exhaustive()
    }
}

/// Wait for the order book to report an order filled.
///
/// Polls the book every `poll` up to `timeout`. Returns `(filled,
/// broker_order_id)`; `(false, None)` on timeout. The reconciler keeps
/// observing after a timeout; a late fill still lands in the book and
/// emits `Filled`, but the caller has moved on.
pub async fn wait_for_fill(
    book: &OrderBook,
    coid: &str,
    timeout: Duration,
    poll: Duration,
) -> (bool, Option<String>) {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut polls = 0u32;

    loop {
        if let Some(record) = book.get(coid) {
            match record.status {
                OrderStatus::Filled => {
                    debug!(coid, polls, "fill confirmed");
                    return (true, record.broker_order_id);
                }
                OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => {
                    debug!(coid, status = ?record.status, "order terminal without fill");
                    return (false, None);
                }
                _ => {}
            }
        }

        if tokio::time::Instant::now() >= deadline {
            info!(coid, polls, "fill wait timed out");
            return (false, None);
        }

        polls += 1;
        tokio::time::sleep(poll).await;
    }
}
