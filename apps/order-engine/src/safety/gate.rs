//! The trade safety gate.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Asia::Ulaanbaatar;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use super::limits::LimitsManager;
use crate::config::{NewsConfig, Session, TradingConfig};
use crate::models::{Side, SymbolInfo};
use crate::news::NewsCalendar;
use crate::risk::lot_by_risk;

/// Everything the gate needs for one decision.
///
/// The gate itself is stateless per call; cooldown and limit state arrive
/// as inputs (the governor's last trade timestamp, the limits file).
#[derive(Debug, Clone)]
pub struct GateContext {
    /// Direction proposed by the strategy.
    pub raw_side: Side,
    /// Last close price.
    pub close: Decimal,
    /// Fast moving average.
    pub ma_fast: Decimal,
    /// Slow moving average.
    pub ma_slow: Decimal,
    /// Relative strength index.
    pub rsi: f64,
    /// Average true range.
    pub atr: Decimal,
    /// Account equity.
    pub equity: Decimal,
    /// Open positions for the symbol.
    pub open_positions: u32,
    /// Contract details for lot sizing.
    pub symbol_info: SymbolInfo,
    /// When the last trade executed.
    pub last_trade_ts: Option<DateTime<Utc>>,
    /// Decision time.
    pub now: DateTime<Utc>,
}

/// Gate verdict: trade with parameters, or hold with a reason.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Direction to trade; `None` means HOLD.
    pub action: Option<Side>,
    /// Why the gate decided this.
    pub reason: String,
    /// Lot size for a non-HOLD decision.
    pub lot: Decimal,
    /// Stop distance in price points.
    pub sl_points: Decimal,
    /// Target distance in price points.
    pub tp_points: Decimal,
}

impl Decision {
    /// A HOLD decision with the failing check's reason.
    #[must_use]
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: None,
            reason: reason.into(),
            lot: Decimal::ZERO,
            sl_points: Decimal::ZERO,
            tp_points: Decimal::ZERO,
        }
    }

    /// Whether the gate held the signal back.
    #[must_use]
    pub const fn is_hold(&self) -> bool {
        self.action.is_none()
    }
}

/// Ordered safety checks between a raw signal and an order request.
pub struct SafetyGate {
    trading: TradingConfig,
    news: NewsConfig,
    limits: LimitsManager,
    calendar: Arc<dyn NewsCalendar>,
}

impl SafetyGate {
    /// Build the gate.
    #[must_use]
    pub fn new(
        trading: TradingConfig,
        news: NewsConfig,
        limits: LimitsManager,
        calendar: Arc<dyn NewsCalendar>,
    ) -> Self {
        Self {
            trading,
            news,
            limits,
            calendar,
        }
    }

    /// The daily limit guard (the pipeline marks trades through it).
    #[must_use]
    pub const fn limits(&self) -> &LimitsManager {
        &self.limits
    }

    /// Run every check in order and produce a decision.
    ///
    /// Check order: daily limits, session window, cooldown, news blackout,
    /// indicator validation. The first failure wins.
    pub async fn filter_decision(&self, ctx: &GateContext) -> Decision {
        let symbol = &self.trading.symbol;

        // 1) Daily limits.
        let (ok, reason) = self
            .limits
            .check_limits(symbol, ctx.now, ctx.open_positions, ctx.equity);
        if !ok {
            return Decision::hold(format!("limits: {reason}"));
        }

        // 2) Session window.
        if !self.in_session(ctx.now) {
            return Decision::hold("out of session window");
        }

        // 3) Cooldown since the last trade.
        if self.cooldown_active(ctx.last_trade_ts, ctx.now) {
            return Decision::hold("cooldown active");
        }

        // 4) News blackout.
        if self.news.enabled
            && self
                .calendar
                .has_high_impact(symbol, self.news.window_min, ctx.now)
                .await
        {
            return Decision::hold("red news window");
        }

        // 5) Trend / oscillator validation.
        if let Some(reason) = self.validate_signal(ctx) {
            return Decision::hold(reason);
        }

        // Size the trade.
        let sl_points = ctx.atr * self.trading.sl_mult;
        let tp_points = ctx.atr * self.trading.tp_mult;
        let sl_price = match ctx.raw_side {
            Side::Buy => ctx.close - sl_points,
            Side::Sell => ctx.close + sl_points,
        };
        let lot = lot_by_risk(
            &ctx.symbol_info,
            ctx.close,
            sl_price,
            ctx.equity,
            self.trading.risk_pct,
        );

        debug!(
            symbol,
            side = %ctx.raw_side,
            %lot,
            %sl_points,
            %tp_points,
            "signal passed safety gate"
        );

        Decision {
            action: Some(ctx.raw_side),
            reason: "OK".to_string(),
            lot,
            sl_points,
            tp_points,
        }
    }

    /// Session windows are defined in Ulaanbaatar local time.
    fn in_session(&self, now: DateTime<Utc>) -> bool {
        match self.trading.session {
            Session::Any => true,
            Session::Tokyo => {
                let local = now.with_timezone(&Ulaanbaatar).time();
                let (h, m) = (local.hour(), local.minute());
                (9, 0) <= (h, m) && (h, m) <= (12, 0)
            }
            Session::LdnNy => {
                // 16:00-02:00, wrapping midnight.
                let hour = now.with_timezone(&Ulaanbaatar).time().hour();
                hour >= 16 || hour <= 2
            }
        }
    }

    fn cooldown_active(&self, last_trade_ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_trade_ts else {
            return false;
        };
        let elapsed_secs = Decimal::from((now - last).num_seconds().max(0));
        let cooldown_secs =
            Decimal::from(self.trading.timeframe_min * 60) * self.trading.cooldown_mult;
        elapsed_secs < cooldown_secs
    }

    /// Trend and oscillator filter around the raw signal.
    fn validate_signal(&self, ctx: &GateContext) -> Option<String> {
        if ctx.atr < self.trading.min_atr {
            return Some(format!(
                "ATR {} below minimum {}",
                ctx.atr, self.trading.min_atr
            ));
        }

        let band = dec!(0.2) * ctx.atr;
        let passes = match ctx.raw_side {
            Side::Buy => {
                ctx.ma_fast > ctx.ma_slow && ctx.rsi >= 49.0 && ctx.close >= ctx.ma_fast - band
            }
            Side::Sell => {
                ctx.ma_fast < ctx.ma_slow && ctx.rsi <= 51.0 && ctx.close <= ctx.ma_fast + band
            }
        };

        if passes {
            None
        } else {
            Some(format!("filtered: {} -> HOLD", ctx.raw_side))
        }
    }
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("symbol", &self.trading.symbol)
            .field("session", &self.trading.session)
            .finish_non_exhaustive()
    }
}
