//! ATR-based stop placement and risk-based lot sizing.

use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{Side, SymbolInfo};

/// Compute absolute stop loss / take profit prices from ATR multiples.
///
/// BUY places the stop below and the target above the entry; SELL mirrors.
#[must_use]
pub fn sl_tp_by_atr(
    side: Side,
    price: Decimal,
    atr: Decimal,
    sl_mult: Decimal,
    tp_mult: Decimal,
) -> (Decimal, Decimal) {
    let sl_distance = atr * sl_mult;
    let tp_distance = atr * tp_mult;
    match side {
        Side::Buy => (price - sl_distance, price + tp_distance),
        Side::Sell => (price + sl_distance, price - tp_distance),
    }
}

/// Compute the lot size that risks `risk_pct` of equity between entry and
/// stop.
///
/// The raw lot is floored to the symbol's volume step and clamped to
/// `[volume_min, volume_max]`. A computed lot below the minimum returns the
/// minimum (logged as a floor, never a block).
#[must_use]
pub fn lot_by_risk(
    info: &SymbolInfo,
    price: Decimal,
    sl: Decimal,
    equity: Decimal,
    risk_pct: Decimal,
) -> Decimal {
    let risk_usd = equity * risk_pct;
    let stop_distance = (price - sl).abs();

    if stop_distance.is_zero() || info.tick_size.is_zero() || info.tick_value.is_zero() {
        debug!(%price, %sl, "degenerate stop distance; falling back to minimum lot");
        return info.volume_min;
    }

    let ticks = stop_distance / info.tick_size;
    let raw_lot = risk_usd / (ticks * info.tick_value);

    // Floor to the step the venue accepts.
    let stepped = if info.volume_step.is_zero() {
        raw_lot
    } else {
        (raw_lot / info.volume_step).floor() * info.volume_step
    };

    if stepped < info.volume_min {
        debug!(%raw_lot, %stepped, min = %info.volume_min, "minimum-lot floor applied");
        return info.volume_min;
    }

    stepped.min(info.volume_max)
}
