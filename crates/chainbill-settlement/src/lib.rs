//! Settlement executor: submits delegated transfers to the execution service and brings the
//! ledger in line with each confirmed transfer exactly once.

pub mod context;
pub mod error;
pub mod executor;
pub mod invoice;
pub mod reconcile;

use async_trait::async_trait;
use chainbill_core::SettlementFailure;
use chrono::{DateTime, Utc};

pub use context::{
    idempotency_key, initial_context, one_time_context, proration_context, renewal_context,
    validate_context,
};
pub use error::{FailedSettlement, SettlementError};
pub use executor::{SettlementExecutor, SettlementOutcome};
pub use invoice::{invoice_for, invoice_number};
pub use reconcile::ReconcileReport;

/// Receives settlement failures that should start or advance failed-payment recovery.
#[async_trait]
pub trait SettlementFailureHandler: Send + Sync {
    async fn handle_failure(
        &self,
        failure: &SettlementFailure,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}
