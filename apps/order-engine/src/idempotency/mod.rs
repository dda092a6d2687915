//! Persistent idempotency ledger.
//!
//! Records every client order id forwarded to the broker so that a retry,
//! restart, or duplicate signal can never submit the same logical order
//! twice. Backed by Turso (Rust rewrite of `SQLite`) for durability across
//! crashes.
//!
//! Failure policy: a store error during [`IdempotencyStore::already_sent`]
//! treats the order as not sent (fail-open, keeps new orders flowing; a
//! false negative produces at worst a logged double-send the broker-side
//! comment dedup catches). A store error during
//! [`IdempotencyStore::record`] is logged and swallowed; the order is
//! already at the broker and must not be failed retroactively.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};
use turso::{Builder, Database, Error as TursoError, Row, Value};

use crate::models::Side;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Query error: {0}")]
    Query(String),

    /// Missing or malformed column.
    #[error("Missing field: {0}")]
    MissingField(String),
}

impl From<TursoError> for StoreError {
    fn from(err: TursoError) -> Self {
        StoreError::Connection(err.to_string())
    }
}

/// One forwarded order in the ledger.
#[derive(Debug, Clone)]
pub struct SentOrderRow {
    /// Deterministic client order id (primary key).
    pub client_order_id: String,
    /// Broker-assigned id, or a synthetic `NETTED_`/`DRYRUN_` marker.
    pub broker_order_id: Option<String>,
    /// When the row was written (UTC, `YYYY-MM-DD HH:MM:SS`).
    pub created_at: String,
    /// Trading symbol.
    pub symbol: String,
    /// Trading direction.
    pub side: Option<Side>,
    /// Quantity in lots.
    pub qty: Decimal,
}

/// Durable conditional-insert ledger of forwarded client order ids.
///
/// Single writer (the executor); readers may observe pre- or post-write
/// state.
pub struct IdempotencyStore {
    db: Arc<Database>,
}

impl IdempotencyStore {
    /// Open (or create) the ledger at the given path.
    pub async fn open(db_path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
            }
        }

        let db = Builder::new_local(db_path).build().await?;
        Self::run_migrations(&db).await?;
        info!(path = db_path, "idempotency ledger opened");
        Ok(Self { db: Arc::new(db) })
    }

    /// Open an in-memory ledger (for testing).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::run_migrations(&db).await?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Share the underlying database (the order book lives in the same file).
    #[must_use]
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    async fn run_migrations(db: &Database) -> Result<(), StoreError> {
        let conn = db.connect()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sent (
                client_order_id TEXT PRIMARY KEY,
                broker_order_id TEXT,
                symbol TEXT NOT NULL DEFAULT '',
                side TEXT,
                qty TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_sent_created_at
             ON sent(created_at);",
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        debug!("idempotency migrations complete");
        Ok(())
    }

    /// Whether an order with this client order id was already forwarded.
    ///
    /// Fail-open: a store error logs a WARN and reports `false` so new
    /// orders are never blocked on a broken ledger.
    pub async fn already_sent(&self, client_order_id: &str) -> bool {
        match self.lookup(client_order_id).await {
            Ok(found) => found,
            Err(e) => {
                metrics::counter!("idempotency_store_errors", "op" => "already_sent").increment(1);
                warn!(
                    coid = client_order_id,
                    error = %e,
                    "ledger unreachable during dedup check; treating order as not sent"
                );
                false
            }
        }
    }

    async fn lookup(&self, client_order_id: &str) -> Result<bool, StoreError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![Value::Text(client_order_id.to_string())];

        let mut rows = conn
            .query(
                "SELECT 1 FROM sent WHERE client_order_id = ? LIMIT 1",
                params,
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let found = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
            .is_some();
        Ok(found)
    }

    /// Record that an order was forwarded to the broker.
    ///
    /// Insert-or-replace on the client order id. Errors are logged and
    /// swallowed: the broker already has the order.
    pub async fn record(
        &self,
        client_order_id: &str,
        broker_order_id: Option<&str>,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) {
        if let Err(e) = self
            .try_record(client_order_id, broker_order_id, symbol, side, qty)
            .await
        {
            metrics::counter!("idempotency_store_errors", "op" => "record").increment(1);
            warn!(
                coid = client_order_id,
                error = %e,
                "failed to record forwarded order; continuing without persistence"
            );
        }
    }

    async fn try_record(
        &self,
        client_order_id: &str,
        broker_order_id: Option<&str>,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<(), StoreError> {
        let conn = self.db.connect()?;

        let params: Vec<Value> = vec![
            Value::Text(client_order_id.to_string()),
            broker_order_id
                .map(|s| Value::Text(s.to_string()))
                .unwrap_or(Value::Null),
            Value::Text(symbol.to_string()),
            Value::Text(side.as_str().to_string()),
            Value::Text(qty.to_string()),
        ];

        conn.execute(
            "INSERT OR REPLACE INTO sent
                (client_order_id, broker_order_id, symbol, side, qty, created_at)
             VALUES (?, ?, ?, ?, ?, datetime('now'))",
            params,
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        debug!(
            coid = client_order_id,
            broker_order_id = broker_order_id.unwrap_or("-"),
            "recorded forwarded order"
        );
        Ok(())
    }

    /// Recently forwarded orders, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<SentOrderRow>, StoreError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![Value::Integer(i64::from(limit))];

        let mut rows = conn
            .query(
                "SELECT client_order_id, broker_order_id, symbol, side, qty, created_at
                 FROM sent
                 ORDER BY created_at DESC, client_order_id DESC
                 LIMIT ?",
                params,
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            out.push(Self::row_to_sent_order(&row)?);
        }
        Ok(out)
    }

    fn row_to_sent_order(row: &Row) -> Result<SentOrderRow, StoreError> {
        Ok(SentOrderRow {
            client_order_id: row
                .get::<String>(0)
                .map_err(|e| StoreError::MissingField(format!("client_order_id: {e}")))?,
            broker_order_id: row.get::<String>(1).ok(),
            symbol: row.get::<String>(2).unwrap_or_default(),
            side: row
                .get::<String>(3)
                .ok()
                .and_then(|s| s.parse::<Side>().ok()),
            qty: row
                .get::<String>(4)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO),
            created_at: row
                .get::<String>(5)
                .map_err(|e| StoreError::MissingField(format!("created_at: {e}")))?,
        })
    }

    /// Delete ledger rows older than the retention window.
    ///
    /// Returns the number of rows removed.
    pub async fn purge_older_than(&self, days: u32) -> Result<u64, StoreError> {
        let conn = self.db.connect()?;
        let params: Vec<Value> = vec![Value::Text(format!("-{days} days"))];

        let deleted = conn
            .execute(
                "DELETE FROM sent WHERE created_at < datetime('now', ?)",
                params,
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        info!(deleted, days, "purged old ledger rows");
        Ok(deleted)
    }
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore").finish_non_exhaustive()
    }
}
