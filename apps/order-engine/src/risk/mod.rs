//! Risk management: the trade governor and position sizing.

mod governor;
mod sizing;

pub use governor::{GovernorState, RiskGovernor};
pub use sizing::{lot_by_risk, sl_tp_by_atr};
