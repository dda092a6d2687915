//! Local order book.
//!
//! The authoritative in-process view of every order the engine believes it
//! has placed, keyed by client order id. Records live in memory behind an
//! `RwLock` (mutations are read-modify-write under the write lock, which
//! gives per-record atomicity) and are mirrored to a Turso table so a
//! restart can resume reconciliation where it left off.
//!
//! Persistence is best-effort: a store failure is logged and the in-memory
//! book keeps going.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};
use turso::{Database, Value};

use crate::models::{Side, LOT_TOLERANCE};

/// Order lifecycle state.
///
/// `Pending -> Accepted -> Partial* -> Filled`; any non-terminal state may
/// move to `Cancelled` or `Rejected`. `Filled`, `Cancelled`, `Rejected` and
/// `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Submitted, not yet acknowledged by the broker.
    Pending,
    /// Acknowledged and working.
    Accepted,
    /// Partially executed.
    Partial,
    /// Completely executed.
    Filled,
    /// Withdrawn before completion.
    Cancelled,
    /// Refused by the broker.
    Rejected,
    /// Lapsed at end of validity.
    Expired,
}

impl OrderStatus {
    /// Whether this state can never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// Whether the order still needs reconciliation.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether a fill may be applied in this state.
    #[must_use]
    pub const fn can_fill(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted | Self::Partial)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "ACCEPTED" => Self::Accepted,
            "PARTIAL" => Self::Partial,
            "FILLED" => Self::Filled,
            "CANCELLED" => Self::Cancelled,
            "REJECTED" => Self::Rejected,
            "EXPIRED" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

/// One order book entry.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    /// Client order id (the key).
    pub coid: String,
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Side,
    /// Requested quantity.
    pub qty: Decimal,
    /// Executed quantity. `filled_qty + remaining_qty == qty` at all times.
    pub filled_qty: Decimal,
    /// Quantity still working.
    pub remaining_qty: Decimal,
    /// Volume-weighted mean price over accepted fills.
    pub avg_fill_price: Decimal,
    /// Lifecycle state.
    pub status: OrderStatus,
    /// Broker-assigned id, once known.
    pub broker_order_id: Option<String>,
    /// Stop loss price.
    pub sl: Option<Decimal>,
    /// Take profit price.
    pub tp: Option<Decimal>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Order book errors.
#[derive(Debug, Error)]
pub enum OrderBookError {
    /// No record for the client order id.
    #[error("order not found: {0}")]
    NotFound(String),

    /// The order cannot receive fills in its current state.
    #[error("order {coid} cannot fill in status {status:?}")]
    CannotFill {
        /// The order's client order id.
        coid: String,
        /// The state that refused the fill.
        status: OrderStatus,
    },

    /// The order is already terminal.
    #[error("order {coid} is terminal ({status:?})")]
    Terminal {
        /// The order's client order id.
        coid: String,
        /// Its terminal state.
        status: OrderStatus,
    },
}

/// In-memory + persisted order book.
pub struct OrderBook {
    orders: RwLock<HashMap<String, OrderRecord>>,
    db: Option<Arc<Database>>,
}

impl OrderBook {
    /// Create a purely in-memory book (tests, dry runs).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Open a book backed by the engine database, restoring every active
    /// order from the previous run.
    pub async fn open(db: Arc<Database>) -> Result<Self, turso::Error> {
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS order_book (
                coid TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty TEXT NOT NULL,
                filled_qty TEXT NOT NULL,
                remaining_qty TEXT NOT NULL,
                avg_fill_price TEXT NOT NULL,
                status TEXT NOT NULL,
                broker_order_id TEXT,
                sl TEXT,
                tp TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_order_book_status
             ON order_book(status);",
        )
        .await?;

        let book = Self {
            orders: RwLock::new(HashMap::new()),
            db: Some(db),
        };
        let restored = book.load_active().await?;
        info!(restored, "order book opened");
        Ok(book)
    }

    async fn load_active(&self) -> Result<usize, turso::Error> {
        let Some(db) = &self.db else { return Ok(0) };
        let conn = db.connect()?;

        let mut rows = conn
            .query(
                "SELECT coid, symbol, side, qty, filled_qty, remaining_qty, avg_fill_price,
                        status, broker_order_id, sl, tp, created_at, updated_at
                 FROM order_book
                 WHERE status NOT IN ('FILLED', 'CANCELLED', 'REJECTED', 'EXPIRED')",
                Vec::<Value>::new(),
            )
            .await?;

        let mut count = 0;
        while let Some(row) = rows.next().await? {
            let Some(record) = Self::row_to_record(&row) else {
                continue;
            };
            if let Ok(mut orders) = self.orders.write() {
                orders.insert(record.coid.clone(), record);
                count += 1;
            }
        }
        Ok(count)
    }

    fn row_to_record(row: &turso::Row) -> Option<OrderRecord> {
        let get_decimal = |i: usize| -> Decimal {
            row.get::<String>(i)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO)
        };
        let get_opt_decimal =
            |i: usize| -> Option<Decimal> { row.get::<String>(i).ok().and_then(|s| s.parse().ok()) };
        let get_time = |i: usize| -> DateTime<Utc> {
            row.get::<String>(i)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map_or_else(Utc::now, |t| t.with_timezone(&Utc))
        };

        Some(OrderRecord {
            coid: row.get::<String>(0).ok()?,
            symbol: row.get::<String>(1).unwrap_or_default(),
            side: row.get::<String>(2).ok()?.parse().ok()?,
            qty: get_decimal(3),
            filled_qty: get_decimal(4),
            remaining_qty: get_decimal(5),
            avg_fill_price: get_decimal(6),
            status: OrderStatus::parse(&row.get::<String>(7).unwrap_or_default()),
            broker_order_id: row.get::<String>(8).ok(),
            sl: get_opt_decimal(9),
            tp: get_opt_decimal(10),
            created_at: get_time(11),
            updated_at: get_time(12),
        })
    }

    /// Mirror a record to the database, best-effort.
    async fn persist(&self, record: &OrderRecord) {
        let Some(db) = &self.db else { return };
        let result = async {
            let conn = db.connect()?;
            let params: Vec<Value> = vec![
                Value::Text(record.coid.clone()),
                Value::Text(record.symbol.clone()),
                Value::Text(record.side.as_str().to_string()),
                Value::Text(record.qty.to_string()),
                Value::Text(record.filled_qty.to_string()),
                Value::Text(record.remaining_qty.to_string()),
                Value::Text(record.avg_fill_price.to_string()),
                Value::Text(record.status.as_str().to_string()),
                record
                    .broker_order_id
                    .as_ref()
                    .map(|s| Value::Text(s.clone()))
                    .unwrap_or(Value::Null),
                record
                    .sl
                    .map(|p| Value::Text(p.to_string()))
                    .unwrap_or(Value::Null),
                record
                    .tp
                    .map(|p| Value::Text(p.to_string()))
                    .unwrap_or(Value::Null),
                Value::Text(record.created_at.to_rfc3339()),
                Value::Text(record.updated_at.to_rfc3339()),
            ];
            conn.execute(
                "INSERT OR REPLACE INTO order_book (
                    coid, symbol, side, qty, filled_qty, remaining_qty, avg_fill_price,
                    status, broker_order_id, sl, tp, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params,
            )
            .await?;
            Ok::<(), turso::Error>(())
        }
        .await;

        if let Err(e) = result {
            metrics::counter!("order_book_store_errors").increment(1);
            warn!(coid = %record.coid, error = %e, "failed to persist order record");
        }
    }

    async fn delete_row(&self, coid: &str) {
        let Some(db) = &self.db else { return };
        let result = async {
            let conn = db.connect()?;
            conn.execute(
                "DELETE FROM order_book WHERE coid = ?",
                vec![Value::Text(coid.to_string())],
            )
            .await?;
            Ok::<(), turso::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(coid, error = %e, "failed to delete order record");
        }
    }

    /// Create or update a record when an order is submitted or acknowledged.
    ///
    /// A new record starts with zero fills; an existing one picks up the
    /// broker id and status.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_on_accept(
        &self,
        coid: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        broker_order_id: Option<&str>,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
        status: OrderStatus,
    ) -> OrderRecord {
        let now = Utc::now();
        let record = {
            let mut orders = match self.orders.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let record = orders
                .entry(coid.to_string())
                .and_modify(|r| {
                    if let Some(id) = broker_order_id {
                        r.broker_order_id = Some(id.to_string());
                    }
                    r.status = status;
                    r.updated_at = now;
                })
                .or_insert_with(|| OrderRecord {
                    coid: coid.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    qty,
                    filled_qty: Decimal::ZERO,
                    remaining_qty: qty,
                    avg_fill_price: Decimal::ZERO,
                    status,
                    broker_order_id: broker_order_id.map(ToString::to_string),
                    sl,
                    tp,
                    created_at: now,
                    updated_at: now,
                });
            record.clone()
        };

        self.persist(&record).await;
        debug!(coid, status = ?record.status, "order upserted");
        record
    }

    /// Apply a fill: update filled/remaining quantities and the
    /// volume-weighted average price; flip to `Filled` when nothing
    /// meaningful remains.
    ///
    /// A fill larger than the remaining quantity is clamped (with a WARN) so
    /// `filled_qty + remaining_qty == qty` always holds.
    pub async fn mark_partial(
        &self,
        coid: &str,
        fill_qty: Decimal,
        fill_price: Decimal,
    ) -> Result<OrderRecord, OrderBookError> {
        let record = {
            let mut orders = match self.orders.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let record = orders
                .get_mut(coid)
                .ok_or_else(|| OrderBookError::NotFound(coid.to_string()))?;

            if !record.status.can_fill() {
                return Err(OrderBookError::CannotFill {
                    coid: coid.to_string(),
                    status: record.status,
                });
            }

            let mut applied = fill_qty;
            if applied > record.remaining_qty {
                warn!(
                    coid,
                    %fill_qty,
                    remaining = %record.remaining_qty,
                    "fill exceeds remaining quantity; clamping"
                );
                applied = record.remaining_qty;
            }

            let new_filled = record.filled_qty + applied;
            if new_filled > Decimal::ZERO {
                record.avg_fill_price = (record.avg_fill_price * record.filled_qty
                    + fill_price * applied)
                    / new_filled;
            }
            record.filled_qty = new_filled;
            record.remaining_qty = record.qty - new_filled;
            record.updated_at = Utc::now();

            record.status = if record.remaining_qty <= LOT_TOLERANCE
                && record.filled_qty > Decimal::ZERO
            {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };

            record.clone()
        };

        self.persist(&record).await;
        Ok(record)
    }

    /// Update the stop loss / take profit on a non-terminal order.
    pub async fn update_stops(
        &self,
        coid: &str,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> Result<OrderRecord, OrderBookError> {
        let record = {
            let mut orders = match self.orders.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let record = orders
                .get_mut(coid)
                .ok_or_else(|| OrderBookError::NotFound(coid.to_string()))?;

            if record.status.is_terminal() {
                return Err(OrderBookError::Terminal {
                    coid: coid.to_string(),
                    status: record.status,
                });
            }

            if sl.is_some() {
                record.sl = sl;
            }
            if tp.is_some() {
                record.tp = tp;
            }
            record.updated_at = Utc::now();
            record.clone()
        };

        self.persist(&record).await;
        Ok(record)
    }

    /// Move a non-terminal order to `Cancelled`.
    pub async fn mark_cancelled(&self, coid: &str) -> Result<OrderRecord, OrderBookError> {
        let record = {
            let mut orders = match self.orders.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let record = orders
                .get_mut(coid)
                .ok_or_else(|| OrderBookError::NotFound(coid.to_string()))?;

            if record.status.is_terminal() {
                return Err(OrderBookError::Terminal {
                    coid: coid.to_string(),
                    status: record.status,
                });
            }

            record.status = OrderStatus::Cancelled;
            record.updated_at = Utc::now();
            record.clone()
        };

        self.persist(&record).await;
        Ok(record)
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, coid: &str) -> Option<OrderRecord> {
        self.orders
            .read()
            .ok()
            .and_then(|orders| orders.get(coid).cloned())
    }

    /// Every non-terminal record.
    #[must_use]
    pub fn get_active_orders(&self) -> Vec<OrderRecord> {
        let orders = match self.orders.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        orders
            .values()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect()
    }

    /// Total record count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.orders.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Drop terminal records older than `max_age`. Returns how many were
    /// removed.
    pub async fn cleanup_old_orders(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = {
            let orders = match self.orders.read() {
                Ok(guard) => guard,
                Err(_) => return 0,
            };
            orders
                .values()
                .filter(|r| r.status.is_terminal() && r.updated_at < cutoff)
                .map(|r| r.coid.clone())
                .collect()
        };

        if stale.is_empty() {
            return 0;
        }

        if let Ok(mut orders) = self.orders.write() {
            for coid in &stale {
                orders.remove(coid);
            }
        }
        for coid in &stale {
            self.delete_row(coid).await;
        }

        debug!(removed = stale.len(), "order book cleanup");
        stale.len()
    }
}

impl std::fmt::Debug for OrderBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBook")
            .field("orders", &self.count())
            .field("persisted", &self.db.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn accepted_order(book: &OrderBook, coid: &str, qty: Decimal) -> OrderRecord {
        book.upsert_on_accept(
            coid,
            "XAUUSD",
            Side::Buy,
            qty,
            Some("broker-1"),
            None,
            None,
            OrderStatus::Accepted,
        )
        .await
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let book = OrderBook::in_memory();

        let created = book
            .upsert_on_accept(
                "coid-1",
                "XAUUSD",
                Side::Buy,
                dec!(0.10),
                None,
                None,
                None,
                OrderStatus::Pending,
            )
            .await;
        assert_eq!(created.status, OrderStatus::Pending);
        assert!(created.broker_order_id.is_none());

        let updated = book
            .upsert_on_accept(
                "coid-1",
                "XAUUSD",
                Side::Buy,
                dec!(0.10),
                Some("broker-7"),
                None,
                None,
                OrderStatus::Accepted,
            )
            .await;
        assert_eq!(updated.status, OrderStatus::Accepted);
        assert_eq!(updated.broker_order_id.as_deref(), Some("broker-7"));
        assert_eq!(book.count(), 1);
    }

    #[tokio::test]
    async fn partial_fill_keeps_quantity_invariant() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;

        let record = book
            .mark_partial("coid-1", dec!(0.04), dec!(2500.00))
            .await
            .unwrap();

        assert_eq!(record.status, OrderStatus::Partial);
        assert_eq!(record.filled_qty, dec!(0.04));
        assert_eq!(record.remaining_qty, dec!(0.06));
        assert_eq!(record.filled_qty + record.remaining_qty, record.qty);
    }

    #[tokio::test]
    async fn vwap_over_multiple_fills() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;

        book.mark_partial("coid-1", dec!(0.04), dec!(2500.00))
            .await
            .unwrap();
        let record = book
            .mark_partial("coid-1", dec!(0.06), dec!(2510.00))
            .await
            .unwrap();

        // (0.04*2500 + 0.06*2510) / 0.10 = 2506.00
        assert_eq!(record.avg_fill_price, dec!(2506.00));
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.remaining_qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn completing_fill_flips_to_filled() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;

        let record = book
            .mark_partial("coid-1", dec!(0.10), dec!(2500.75))
            .await
            .unwrap();
        assert_eq!(record.status, OrderStatus::Filled);
        assert_eq!(record.avg_fill_price, dec!(2500.75));
    }

    #[tokio::test]
    async fn oversized_fill_is_clamped() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;

        let record = book
            .mark_partial("coid-1", dec!(0.25), dec!(2500.00))
            .await
            .unwrap();
        assert_eq!(record.filled_qty, dec!(0.10));
        assert_eq!(record.remaining_qty, Decimal::ZERO);
        assert_eq!(record.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn fill_on_terminal_order_errors() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;
        book.mark_partial("coid-1", dec!(0.10), dec!(2500.00))
            .await
            .unwrap();

        let err = book
            .mark_partial("coid-1", dec!(0.01), dec!(2500.00))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderBookError::CannotFill { .. }));
    }

    #[tokio::test]
    async fn fill_on_unknown_order_errors() {
        let book = OrderBook::in_memory();
        let err = book
            .mark_partial("missing", dec!(0.01), dec!(2500.00))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderBookError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_stops_on_working_order() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;

        let record = book
            .update_stops("coid-1", Some(dec!(2490)), None)
            .await
            .unwrap();
        assert_eq!(record.sl, Some(dec!(2490)));
        assert_eq!(record.tp, None);

        book.mark_partial("coid-1", dec!(0.10), dec!(2500.00))
            .await
            .unwrap();
        let err = book
            .update_stops("coid-1", Some(dec!(2491)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderBookError::Terminal { .. }));
    }

    #[tokio::test]
    async fn cancel_preserves_partial_fills() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "coid-1", dec!(0.10)).await;
        book.mark_partial("coid-1", dec!(0.04), dec!(2500.00))
            .await
            .unwrap();

        let record = book.mark_cancelled("coid-1").await.unwrap();
        assert_eq!(record.status, OrderStatus::Cancelled);
        assert_eq!(record.filled_qty, dec!(0.04));

        let err = book.mark_cancelled("coid-1").await.unwrap_err();
        assert!(matches!(err, OrderBookError::Terminal { .. }));
    }

    #[tokio::test]
    async fn active_orders_excludes_terminal() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "working", dec!(0.10)).await;
        accepted_order(&book, "done", dec!(0.10)).await;
        book.mark_partial("done", dec!(0.10), dec!(2500.00))
            .await
            .unwrap();

        let active = book.get_active_orders();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].coid, "working");
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_orders() {
        let book = OrderBook::in_memory();
        accepted_order(&book, "working", dec!(0.10)).await;
        accepted_order(&book, "done", dec!(0.10)).await;
        book.mark_partial("done", dec!(0.10), dec!(2500.00))
            .await
            .unwrap();

        // Nothing old enough yet.
        assert_eq!(book.cleanup_old_orders(chrono::Duration::hours(24)).await, 0);
        // Zero max-age sweeps the filled order but not the working one.
        assert_eq!(book.cleanup_old_orders(chrono::Duration::zero()).await, 1);
        assert!(book.get("done").is_none());
        assert!(book.get("working").is_some());
    }

    #[tokio::test]
    async fn persisted_book_restores_active_orders() {
        let db = Arc::new(turso::Builder::new_local(":memory:").build().await.unwrap());

        // Turso in-memory databases are per-handle; keep one handle and
        // reopen the book over it to simulate restart.
        let book = OrderBook::open(Arc::clone(&db)).await.unwrap();
        accepted_order(&book, "survivor", dec!(0.10)).await;
        book.mark_partial("survivor", dec!(0.04), dec!(2500.00))
            .await
            .unwrap();
        accepted_order(&book, "finished", dec!(0.10)).await;
        book.mark_partial("finished", dec!(0.10), dec!(2500.00))
            .await
            .unwrap();
        drop(book);

        let reopened = OrderBook::open(db).await.unwrap();
        let record = reopened.get("survivor").expect("active order restored");
        assert_eq!(record.status, OrderStatus::Partial);
        assert_eq!(record.filled_qty, dec!(0.04));
        // Terminal orders are not reloaded.
        assert!(reopened.get("finished").is_none());
    }
}
