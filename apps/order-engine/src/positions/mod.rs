//! Position netting policy and aggregation.
//!
//! [`PositionAggregator`] is a pure function over the incoming order and the
//! current broker positions: no I/O, deterministic, table-testable. The
//! executor dispatches its [`ReduceAction`]s before forwarding any residual
//! volume.

mod aggregator;

pub use aggregator::{NettingResult, PositionAggregator, ReduceAction};

use serde::{Deserialize, Serialize};

/// How same-symbol opposite orders interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NettingMode {
    /// Opposing orders reduce or close existing positions.
    Netting,
    /// Opposing orders coexist as independent positions.
    Hedging,
}

/// Which existing positions absorb an incoming opposing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReduceRule {
    /// Oldest positions reduce first.
    Fifo,
    /// Newest positions reduce first.
    Lifo,
    /// All positions reduce pro-rata by volume.
    Proportional,
}

impl std::fmt::Display for NettingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Netting => "NETTING",
            Self::Hedging => "HEDGING",
        })
    }
}

impl std::fmt::Display for ReduceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
            Self::Proportional => "PROPORTIONAL",
        })
    }
}
