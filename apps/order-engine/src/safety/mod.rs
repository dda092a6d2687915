//! Trade safety gate and daily limit guard.
//!
//! The gate runs once per signal, after the risk governor: daily limits,
//! session window, cooldown, news blackout, then indicator validation.
//! Every rejection is a HOLD carrying the failing check's reason.

mod gate;
mod limits;

pub use gate::{Decision, GateContext, SafetyGate};
pub use limits::{LimitsEntry, LimitsManager};
