//! Risk governor: session budget, loss-streak cooldown, news blackout.
//!
//! Three cumulative sub-states that independently block trading. State is
//! persisted as a single JSON document and survives restarts; all
//! timestamps are UTC. The session date rolls at the Ulaanbaatar calendar
//! day boundary, matching the daily-limits store.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Asia::Ulaanbaatar;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GovernorConfig;
use crate::news::NewsImpact;

/// Persisted governor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorState {
    /// Trades executed this session day.
    pub trades_today: u32,
    /// Losing trades in a row.
    pub consecutive_losses: u32,
    /// When the last trade executed.
    pub last_trade_ts: Option<DateTime<Utc>>,
    /// Loss-streak cooldown expiry.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// News blackout expiry.
    pub blackout_until: Option<DateTime<Utc>>,
    /// Session day (Ulaanbaatar calendar date).
    pub session_date: NaiveDate,
}

impl GovernorState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            trades_today: 0,
            consecutive_losses: 0,
            last_trade_ts: None,
            cooldown_until: None,
            blackout_until: None,
            session_date: session_date_of(now),
        }
    }
}

/// The trading-day boundary is Ulaanbaatar local midnight.
fn session_date_of(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Ulaanbaatar).date_naive()
}

/// Second-layer gate consulted before the safety gate.
pub struct RiskGovernor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
    path: Option<PathBuf>,
}

impl RiskGovernor {
    /// Create a governor persisting to the configured state path, loading
    /// any surviving state from a previous run.
    #[must_use]
    pub fn new(config: GovernorConfig, now: DateTime<Utc>) -> Self {
        let path = PathBuf::from(&config.state_path);
        let state = Self::load(&path).unwrap_or_else(|| GovernorState::fresh(now));
        Self {
            config,
            state: Mutex::new(state),
            path: Some(path),
        }
    }

    /// Create a governor with no persistence (tests, backtests).
    #[must_use]
    pub fn in_memory(config: GovernorConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: Mutex::new(GovernorState::fresh(now)),
            path: None,
        }
    }

    fn load(path: &PathBuf) -> Option<GovernorState> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(state) => {
                info!(path = %path.display(), "governor state restored");
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "governor state unreadable; starting fresh");
                None
            }
        }
    }

    fn persist(&self, state: &GovernorState) {
        let Some(path) = &self.path else { return };
        let Ok(json) = serde_json::to_string_pretty(state) else {
            return;
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, json).and_then(|()| std::fs::rename(&tmp, path)) {
            warn!(path = %path.display(), error = %e, "failed to persist governor state");
        }
    }

    /// Reset session counters when the Ulaanbaatar day changed.
    fn roll_session(state: &mut GovernorState, now: DateTime<Utc>) {
        let today = session_date_of(now);
        if state.session_date != today {
            info!(
                from = %state.session_date,
                to = %today,
                "governor session rolled; trade budget reset"
            );
            state.session_date = today;
            state.trades_today = 0;
        }
    }

    /// Whether trading is currently allowed.
    ///
    /// Returns `(false, reason)` naming the first failing sub-state.
    pub fn can_trade(&self, now: DateTime<Utc>) -> (bool, String) {
        let Ok(mut state) = self.state.lock() else {
            return (false, "governor state poisoned".to_string());
        };
        Self::roll_session(&mut state, now);

        if state.trades_today >= self.config.session_limit {
            return (
                false,
                format!(
                    "session_budget exhausted ({}/{})",
                    state.trades_today, self.config.session_limit
                ),
            );
        }

        if let Some(until) = state.cooldown_until {
            if now < until {
                return (
                    false,
                    format!(
                        "loss_streak cooldown active until {} ({} losses)",
                        until.format("%H:%M:%S"),
                        state.consecutive_losses
                    ),
                );
            }
        }

        if let Some(until) = state.blackout_until {
            if now < until {
                return (
                    false,
                    format!("news_blackout until {}", until.format("%H:%M:%S")),
                );
            }
        }

        (true, "OK".to_string())
    }

    /// Count an executed trade against the session budget.
    pub fn record_trade(&self, now: DateTime<Utc>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        Self::roll_session(&mut state, now);
        state.trades_today += 1;
        state.last_trade_ts = Some(now);
        metrics::gauge!("governor_session_trades").set(f64::from(state.trades_today));
        self.persist(&state);
    }

    /// Update the loss streak from a closed trade.
    ///
    /// A loss extends the streak and, at the threshold, arms the cooldown; a
    /// win resets the streak. Break-even trades leave it unchanged.
    pub fn on_trade_closed(&self, pnl: rust_decimal::Decimal, now: DateTime<Utc>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        Self::roll_session(&mut state, now);

        if pnl < rust_decimal::Decimal::ZERO {
            state.consecutive_losses += 1;
            if state.consecutive_losses >= self.config.loss_streak_threshold {
                let until = now + chrono::Duration::minutes(i64::from(self.config.cooldown_minutes));
                state.cooldown_until = Some(until);
                warn!(
                    losses = state.consecutive_losses,
                    until = %until,
                    "loss streak threshold hit; cooldown armed"
                );
            }
        } else if pnl > rust_decimal::Decimal::ZERO {
            state.consecutive_losses = 0;
        }

        metrics::gauge!("governor_consecutive_losses").set(f64::from(state.consecutive_losses));
        self.persist(&state);
    }

    /// Arm the news blackout for a calendar event of the given impact.
    pub fn apply_news_blackout(&self, impact: NewsImpact, now: DateTime<Utc>) {
        let minutes = impact.blackout_minutes();
        if minutes == 0 {
            return;
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let until = now + chrono::Duration::minutes(i64::from(minutes));
        state.blackout_until = Some(until);
        info!(?impact, until = %until, "news blackout armed");
        self.persist(&state);
    }

    /// When the last trade executed (the safety gate's cooldown input).
    #[must_use]
    pub fn last_trade_ts(&self) -> Option<DateTime<Utc>> {
        self.state.lock().ok().and_then(|s| s.last_trade_ts)
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state_summary(&self) -> GovernorState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| GovernorState::fresh(Utc::now()))
    }
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
