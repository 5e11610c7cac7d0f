//! In-memory doubles for the external collaborators, for use in tests.

mod execution;
mod notifier;
mod tax;

pub use execution::ScriptedExecutionService;
pub use notifier::RecordingNotifier;
pub use tax::{FailingCalculator, FixedDiscount, FlatRateTax};
