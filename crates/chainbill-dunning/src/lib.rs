//! Failed-payment recovery: campaigns that retry and notify on a per-workspace schedule.

pub mod actions;
pub mod engine;

pub use actions::{
    ActionOutcome, ActionRegistry, DunningActionHandler, NotifyAction, RetryPaymentAction,
};
pub use engine::{DunningEngine, DunningSweepReport};
