//! Subscription state machine, redemption ledger rules and the lifecycle operations built on them.

pub mod redemption;
pub mod service;
pub mod transitions;

pub use redemption::{
    RedemptionEffect, apply_redemption, ensure_redeemable, initial_subscription,
    remaining_redemptions,
};
pub use service::{
    PauseOutcome, ResumeOutcome, SubscriptionLifecycle, UpgradeOutcome, UpgradePreview,
};
pub use transitions::{allowed_transitions, can_transition, validate_transition};
