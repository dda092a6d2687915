//! Netting aggregation over existing positions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{NettingMode, ReduceRule};
use crate::models::{Position, Side};

/// Lot precision used when splitting volume across positions.
const LOT_SCALE: u32 = 5;

/// An instruction to reduce one existing position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceAction {
    /// Ticket of the position to reduce.
    pub position_ticket: String,
    /// Volume to close, in lots.
    pub reduce_volume: Decimal,
    /// Reference close price (zero when the incoming order has none).
    pub close_price: Decimal,
    /// Why this reduction happens.
    pub reason: String,
}

/// Result of netting an incoming order against existing positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NettingResult {
    /// Reductions to dispatch before the residual order.
    pub reduce_actions: Vec<ReduceAction>,
    /// Volume left to submit as a new order. Non-negative.
    pub remaining_volume: Decimal,
    /// Volume-weighted mean entry price of the reduced positions.
    pub average_close_price: Decimal,
    /// Net position side after the order executes, if any.
    pub net_position_side: Option<Side>,
    /// Human-readable outcome description.
    pub summary: String,
}

/// Pure netting logic: mode + rule + incoming order + positions in,
/// reduce actions + residual out.
#[derive(Debug, Clone, Copy)]
pub struct PositionAggregator {
    mode: NettingMode,
    rule: ReduceRule,
}

impl PositionAggregator {
    /// Create an aggregator with the given policy.
    #[must_use]
    pub const fn new(mode: NettingMode, rule: ReduceRule) -> Self {
        Self { mode, rule }
    }

    /// The configured netting mode.
    #[must_use]
    pub const fn mode(&self) -> NettingMode {
        self.mode
    }

    /// The configured reduce rule.
    #[must_use]
    pub const fn rule(&self) -> ReduceRule {
        self.rule
    }

    /// Process an incoming order against the existing positions for its
    /// symbol.
    #[must_use]
    pub fn process(
        &self,
        side: Side,
        volume: Decimal,
        price: Option<Decimal>,
        existing: &[Position],
    ) -> NettingResult {
        if self.mode == NettingMode::Hedging {
            return NettingResult {
                reduce_actions: Vec::new(),
                remaining_volume: volume,
                average_close_price: Decimal::ZERO,
                net_position_side: Some(side),
                summary: format!("HEDGING mode: new {side} {volume} position opened"),
            };
        }

        self.process_netting(side, volume, price.unwrap_or(Decimal::ZERO), existing)
    }

    fn process_netting(
        &self,
        side: Side,
        volume: Decimal,
        close_price: Decimal,
        existing: &[Position],
    ) -> NettingResult {
        let opposite_side = side.opposite();
        let opposite: Vec<&Position> = existing
            .iter()
            .filter(|p| p.side == opposite_side)
            .collect();

        if opposite.is_empty() {
            return NettingResult {
                reduce_actions: Vec::new(),
                remaining_volume: volume,
                average_close_price: Decimal::ZERO,
                net_position_side: Some(side),
                summary: format!("NETTING: no opposite positions, new {side} {volume} opened"),
            };
        }

        let total_opposite: Decimal = opposite.iter().map(|p| p.volume).sum();

        if volume >= total_opposite {
            // Full closure of every opposite position, possibly with residual.
            let actions = opposite
                .iter()
                .map(|p| ReduceAction {
                    position_ticket: p.ticket.clone(),
                    reduce_volume: p.volume,
                    close_price,
                    reason: "full closure via netting".to_string(),
                })
                .collect();
            let remaining = volume - total_opposite;
            let avg_close = weighted_entry_price(&opposite);

            let (net_side, summary) = if remaining > Decimal::ZERO {
                (
                    Some(side),
                    format!(
                        "NETTING: closed {total_opposite} {opposite_side} @{avg_close}, \
                         opened {remaining} {side}"
                    ),
                )
            } else {
                (
                    None,
                    format!("NETTING: closed {total_opposite} {opposite_side} @{avg_close}, flat"),
                )
            };

            debug!(%side, %volume, %total_opposite, %remaining, "netting full closure");
            return NettingResult {
                reduce_actions: actions,
                remaining_volume: remaining,
                average_close_price: avg_close,
                net_position_side: net_side,
                summary,
            };
        }

        // Partial reduction distributed by the configured rule.
        let actions = match self.rule {
            ReduceRule::Fifo => reduce_sequential(&opposite, volume, close_price, "FIFO", false),
            ReduceRule::Lifo => reduce_sequential(&opposite, volume, close_price, "LIFO", true),
            ReduceRule::Proportional => {
                reduce_proportional(&opposite, total_opposite, volume, close_price)
            }
        };

        let touched: Vec<&Position> = opposite
            .iter()
            .filter(|p| actions.iter().any(|a| a.position_ticket == p.ticket))
            .copied()
            .collect();
        let avg_close = weighted_entry_price(&touched);
        let remaining_opposite = total_opposite - volume;

        debug!(%side, %volume, rule = %self.rule, actions = actions.len(), "netting partial reduction");
        NettingResult {
            reduce_actions: actions,
            remaining_volume: Decimal::ZERO,
            average_close_price: avg_close,
            net_position_side: Some(opposite_side),
            summary: format!(
                "NETTING: reduced {volume} {opposite_side} @{avg_close}, \
                 {remaining_opposite} {opposite_side} remaining"
            ),
        }
    }
}

/// Volume-weighted mean entry price over the given positions.
fn weighted_entry_price(positions: &[&Position]) -> Decimal {
    let total: Decimal = positions.iter().map(|p| p.volume).sum();
    if total.is_zero() {
        return Decimal::ZERO;
    }
    let weighted: Decimal = positions.iter().map(|p| p.entry_price * p.volume).sum();
    weighted / total
}

/// Consume positions in open-time order until the reduction volume is spent.
fn reduce_sequential(
    positions: &[&Position],
    total_volume: Decimal,
    close_price: Decimal,
    rule_name: &str,
    newest_first: bool,
) -> Vec<ReduceAction> {
    let mut sorted: Vec<&Position> = positions.to_vec();
    sorted.sort_by_key(|p| p.open_time);
    if newest_first {
        sorted.reverse();
    }

    let mut actions = Vec::new();
    let mut remaining = total_volume;

    for position in sorted {
        if remaining <= Decimal::ZERO {
            break;
        }

        if position.volume <= remaining {
            actions.push(ReduceAction {
                position_ticket: position.ticket.clone(),
                reduce_volume: position.volume,
                close_price,
                reason: format!("full closure via {rule_name} netting"),
            });
            remaining -= position.volume;
        } else {
            actions.push(ReduceAction {
                position_ticket: position.ticket.clone(),
                reduce_volume: remaining,
                close_price,
                reason: format!("partial closure via {rule_name} netting"),
            });
            remaining = Decimal::ZERO;
        }
    }

    actions
}

/// Split the reduction pro-rata by position volume.
///
/// Each share is rounded to lot precision and clamped to the position size;
/// the rounding residual lands on the last position so the split never
/// synthesizes volume that was not there.
fn reduce_proportional(
    positions: &[&Position],
    total_position_volume: Decimal,
    total_volume: Decimal,
    close_price: Decimal,
) -> Vec<ReduceAction> {
    if total_position_volume.is_zero() {
        return Vec::new();
    }

    let mut actions = Vec::new();
    let mut assigned = Decimal::ZERO;

    for (i, position) in positions.iter().enumerate() {
        let is_last = i + 1 == positions.len();
        let share = if is_last {
            // Residual, clamped downward to the position size.
            (total_volume - assigned).min(position.volume)
        } else {
            (total_volume * position.volume / total_position_volume)
                .round_dp(LOT_SCALE)
                .min(position.volume)
        };

        if share <= Decimal::ZERO {
            continue;
        }

        assigned += share;
        actions.push(ReduceAction {
            position_ticket: position.ticket.clone(),
            reduce_volume: share,
            close_price,
            reason: "proportional closure via netting".to_string(),
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LOT_TOLERANCE;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn pos(ticket: &str, side: Side, volume: Decimal, entry: Decimal, age_min: i64) -> Position {
        Position {
            ticket: ticket.to_string(),
            comment: String::new(),
            symbol: "XAUUSD".to_string(),
            side,
            volume,
            entry_price: entry,
            open_time: Utc::now() - Duration::minutes(age_min),
            sl: None,
            tp: None,
        }
    }

    fn action_volume(result: &NettingResult, ticket: &str) -> Decimal {
        result
            .reduce_actions
            .iter()
            .find(|a| a.position_ticket == ticket)
            .map(|a| a.reduce_volume)
            .unwrap_or_default()
    }

    #[test]
    fn hedging_mode_never_reduces() {
        let agg = PositionAggregator::new(NettingMode::Hedging, ReduceRule::Fifo);
        let existing = vec![pos("t1", Side::Buy, dec!(0.5), dec!(2500), 30)];

        let result = agg.process(Side::Sell, dec!(0.3), Some(dec!(2501)), &existing);

        assert!(result.reduce_actions.is_empty());
        assert_eq!(result.remaining_volume, dec!(0.3));
        assert_eq!(result.net_position_side, Some(Side::Sell));
        assert!(result.summary.contains("HEDGING"));
    }

    #[test]
    fn no_opposite_positions_passes_through() {
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo);
        let existing = vec![pos("t1", Side::Buy, dec!(0.5), dec!(2500), 30)];

        let result = agg.process(Side::Buy, dec!(0.2), None, &existing);

        assert!(result.reduce_actions.is_empty());
        assert_eq!(result.remaining_volume, dec!(0.2));
        assert_eq!(result.net_position_side, Some(Side::Buy));
    }

    #[test]
    fn full_closure_with_residual_fifo() {
        // Existing BUY 0.5 + 0.3; incoming SELL 1.2 closes both, 0.4 remains.
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo);
        let existing = vec![
            pos("t1", Side::Buy, dec!(0.5), dec!(2500), 30),
            pos("t2", Side::Buy, dec!(0.3), dec!(2505), 20),
        ];

        let result = agg.process(Side::Sell, dec!(1.2), Some(dec!(2502)), &existing);

        assert_eq!(result.reduce_actions.len(), 2);
        assert_eq!(action_volume(&result, "t1"), dec!(0.5));
        assert_eq!(action_volume(&result, "t2"), dec!(0.3));
        assert_eq!(result.remaining_volume, dec!(0.4));
        assert_eq!(result.net_position_side, Some(Side::Sell));
    }

    #[test]
    fn exact_closure_goes_flat() {
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo);
        let existing = vec![pos("t1", Side::Buy, dec!(0.5), dec!(2500), 30)];

        let result = agg.process(Side::Sell, dec!(0.5), Some(dec!(2502)), &existing);

        assert_eq!(result.remaining_volume, Decimal::ZERO);
        assert_eq!(result.net_position_side, None);
        assert!(result.summary.contains("flat"));
    }

    #[test]
    fn fifo_consumes_oldest_first() {
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Fifo);
        let existing = vec![
            pos("newer", Side::Buy, dec!(0.4), dec!(2505), 10),
            pos("older", Side::Buy, dec!(0.4), dec!(2500), 60),
        ];

        let result = agg.process(Side::Sell, dec!(0.5), Some(dec!(2502)), &existing);

        assert_eq!(action_volume(&result, "older"), dec!(0.4));
        assert_eq!(action_volume(&result, "newer"), dec!(0.1));
        assert_eq!(result.remaining_volume, Decimal::ZERO);
        assert_eq!(result.net_position_side, Some(Side::Buy));
    }

    #[test]
    fn lifo_consumes_newest_first() {
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Lifo);
        let existing = vec![
            pos("newer", Side::Buy, dec!(0.4), dec!(2505), 10),
            pos("older", Side::Buy, dec!(0.4), dec!(2500), 60),
        ];

        let result = agg.process(Side::Sell, dec!(0.5), Some(dec!(2502)), &existing);

        assert_eq!(action_volume(&result, "newer"), dec!(0.4));
        assert_eq!(action_volume(&result, "older"), dec!(0.1));
    }

    #[test]
    fn proportional_reduction_distributes_pro_rata() {
        // Positions 0.4 / 0.4 / 0.2, incoming SELL 0.5:
        // shares 0.2 / 0.2 / 0.1, average close (0.4*2500+0.4*2505+0.2*2510)/1.0.
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Proportional);
        let existing = vec![
            pos("t1", Side::Buy, dec!(0.4), dec!(2500), 60),
            pos("t2", Side::Buy, dec!(0.4), dec!(2505), 40),
            pos("t3", Side::Buy, dec!(0.2), dec!(2510), 20),
        ];

        let result = agg.process(Side::Sell, dec!(0.5), Some(dec!(2504)), &existing);

        assert!((action_volume(&result, "t1") - dec!(0.2)).abs() <= LOT_TOLERANCE);
        assert!((action_volume(&result, "t2") - dec!(0.2)).abs() <= LOT_TOLERANCE);
        assert!((action_volume(&result, "t3") - dec!(0.1)).abs() <= LOT_TOLERANCE);
        assert_eq!(result.remaining_volume, Decimal::ZERO);
        assert_eq!(result.net_position_side, Some(Side::Buy));
        assert_eq!(result.average_close_price, dec!(2504.0));
    }

    #[test]
    fn proportional_rounding_never_exceeds_position_size() {
        let agg = PositionAggregator::new(NettingMode::Netting, ReduceRule::Proportional);
        let existing = vec![
            pos("t1", Side::Buy, dec!(0.01), dec!(2500), 60),
            pos("t2", Side::Buy, dec!(0.07), dec!(2505), 20),
        ];

        let result = agg.process(Side::Sell, dec!(0.05), Some(dec!(2504)), &existing);

        for action in &result.reduce_actions {
            let original = existing
                .iter()
                .find(|p| p.ticket == action.position_ticket)
                .unwrap();
            assert!(action.reduce_volume <= original.volume);
        }
        let total: Decimal = result.reduce_actions.iter().map(|a| a.reduce_volume).sum();
        assert!(total <= dec!(0.05) + LOT_TOLERANCE);
    }

    proptest! {
        /// Conservation: dispatched reductions plus residual always equal the
        /// incoming volume for sequential rules, and never exceed it for the
        /// proportional rule.
        #[test]
        fn netting_conserves_volume(
            vols in proptest::collection::vec(1u32..=500, 1..6),
            incoming in 1u32..=2000,
            rule_idx in 0usize..3,
        ) {
            let rule = [ReduceRule::Fifo, ReduceRule::Lifo, ReduceRule::Proportional][rule_idx];
            let agg = PositionAggregator::new(NettingMode::Netting, rule);

            let existing: Vec<Position> = vols
                .iter()
                .enumerate()
                .map(|(i, v)| pos(
                    &format!("t{i}"),
                    Side::Buy,
                    Decimal::new(i64::from(*v), 2),
                    dec!(2500),
                    i as i64 * 10,
                ))
                .collect();

            let incoming_vol = Decimal::new(i64::from(incoming), 2);
            let result = agg.process(Side::Sell, incoming_vol, Some(dec!(2500)), &existing);

            let reduced: Decimal = result.reduce_actions.iter().map(|a| a.reduce_volume).sum();
            let accounted = reduced + result.remaining_volume;

            match rule {
                ReduceRule::Proportional => prop_assert!(accounted <= incoming_vol + LOT_TOLERANCE),
                _ => prop_assert!((accounted - incoming_vol).abs() <= LOT_TOLERANCE),
            }

            // Never close more than a position holds.
            for action in &result.reduce_actions {
                let original = existing
                    .iter()
                    .find(|p| p.ticket == action.position_ticket)
                    .unwrap();
                prop_assert!(action.reduce_volume <= original.volume + LOT_TOLERANCE);
            }
        }
    }
}
