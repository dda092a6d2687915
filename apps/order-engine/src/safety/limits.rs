//! Daily trading limits, keyed by trading day and symbol.
//!
//! State lives in a small JSON file of `{yyyy-mm-dd:symbol -> entry}`
//! records, written atomically (tmp + rename). The trading day boundary is
//! the Ulaanbaatar calendar day: every key and every roll-over in this
//! store uses `Asia/Ulaanbaatar`, not UTC.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use chrono_tz::Asia::Ulaanbaatar;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::LimitsConfig;

/// Per-day, per-symbol limit state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsEntry {
    /// Trades executed this trading day.
    pub trades: u32,
    /// First equity observed this trading day (drawdown baseline).
    pub baseline_equity: Option<Decimal>,
    /// Day is blocked until the next trading day.
    pub blocked: bool,
}

/// Daily limit guard backing the safety gate's first check.
pub struct LimitsManager {
    config: LimitsConfig,
    path: PathBuf,
}

impl LimitsManager {
    /// Create a manager persisting to the configured state path.
    #[must_use]
    pub fn new(config: LimitsConfig) -> Self {
        let path = PathBuf::from(&config.state_path);
        Self { config, path }
    }

    /// Key for a symbol on the trading day containing `now`.
    fn key(symbol: &str, now: DateTime<Utc>) -> String {
        let day = now.with_timezone(&Ulaanbaatar).date_naive();
        format!("{}:{symbol}", day.format("%Y-%m-%d"))
    }

    fn load(&self) -> HashMap<String, LimitsEntry> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "limits state unreadable; starting fresh");
            HashMap::new()
        })
    }

    fn save(&self, data: &HashMap<String, LimitsEntry>) {
        let Ok(json) = serde_json::to_string_pretty(data) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, &self.path))
        {
            warn!(path = %self.path.display(), error = %e, "failed to persist limits state");
        }
    }

    /// Current entry for the symbol's trading day.
    #[must_use]
    pub fn get_state(&self, symbol: &str, now: DateTime<Utc>) -> LimitsEntry {
        self.load()
            .remove(&Self::key(symbol, now))
            .unwrap_or_default()
    }

    fn set_state(&self, symbol: &str, now: DateTime<Utc>, entry: LimitsEntry) {
        let mut data = self.load();
        data.insert(Self::key(symbol, now), entry);
        self.save(&data);
    }

    /// Record the day's first observed equity as the drawdown baseline.
    pub fn ensure_baseline(&self, symbol: &str, now: DateTime<Utc>, equity: Decimal) {
        if equity <= Decimal::ZERO {
            return;
        }
        let mut entry = self.get_state(symbol, now);
        if entry.baseline_equity.is_none() {
            entry.baseline_equity = Some(equity);
            self.set_state(symbol, now, entry);
        }
    }

    /// Count an executed trade against the day's budget.
    pub fn mark_trade(&self, symbol: &str, now: DateTime<Utc>) {
        let mut entry = self.get_state(symbol, now);
        entry.trades += 1;
        self.set_state(symbol, now, entry);
    }

    /// Check every daily limit.
    ///
    /// Returns `(false, reason)` on the first violated limit. A drawdown
    /// violation also sets the persistent blocked flag, holding the rest of
    /// the trading day.
    pub fn check_limits(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
        open_positions: u32,
        equity: Decimal,
    ) -> (bool, String) {
        if !self.config.enabled {
            return (true, String::new());
        }

        let mut entry = self.get_state(symbol, now);

        if entry.blocked {
            return (false, "daily limits reached (blocked)".to_string());
        }

        if open_positions >= self.config.max_open_positions {
            return (
                false,
                format!(
                    "max open positions {open_positions}/{}",
                    self.config.max_open_positions
                ),
            );
        }

        if entry.trades >= self.config.max_trades_per_day {
            return (
                false,
                format!(
                    "max trades per day {}/{}",
                    entry.trades, self.config.max_trades_per_day
                ),
            );
        }

        let baseline = match entry.baseline_equity {
            Some(b) => b,
            None if equity > Decimal::ZERO => {
                entry.baseline_equity = Some(equity);
                self.set_state(symbol, now, entry.clone());
                equity
            }
            None => return (true, String::new()),
        };

        if baseline > Decimal::ZERO {
            let drawdown_pct =
                ((baseline - equity) / baseline * Decimal::ONE_HUNDRED).max(Decimal::ZERO);
            if drawdown_pct >= self.config.max_daily_loss_pct {
                entry.blocked = true;
                self.set_state(symbol, now, entry);
                return (
                    false,
                    format!(
                        "daily loss hit: {drawdown_pct:.2}% >= {}%",
                        self.config.max_daily_loss_pct
                    ),
                );
            }
        }

        (true, String::new())
    }
}

impl std::fmt::Debug for LimitsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitsManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
