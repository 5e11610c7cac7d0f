//! Periodic sweeps: due scheduled changes and due redemptions.

mod failures;
pub mod processor;
pub mod redemptions;

pub use processor::{ChangeSweepReport, ScheduledChangeProcessor};
pub use redemptions::{RedemptionSweep, RedemptionSweepReport, charge_proration};
