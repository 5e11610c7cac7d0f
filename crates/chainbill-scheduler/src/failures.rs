use std::fmt;
use std::sync::Arc;

use chainbill_core::SettlementErrorKind;
use chainbill_lifecycle::SubscriptionLifecycle;
use chainbill_settlement::{FailedSettlement, SettlementFailureHandler};
use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

/// What became of a failed renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureRouting {
    /// Marked overdue and handed to recovery.
    Overdue,
    /// Left as is; the next sweep tries again.
    Deferred,
    /// Funds moved; reconciliation finishes the ledger.
    Reconcile,
}

impl fmt::Display for FailureRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureRouting::Overdue => "overdue",
            FailureRouting::Deferred => "deferred",
            FailureRouting::Reconcile => "awaiting reconciliation",
        };
        f.write_str(label)
    }
}

pub(crate) async fn route_failure(
    lifecycle: &SubscriptionLifecycle,
    handler: Option<&Arc<dyn SettlementFailureHandler>>,
    subscription_id: Uuid,
    failed: &FailedSettlement,
    now: DateTime<Utc>,
) -> FailureRouting {
    match failed.kind() {
        SettlementErrorKind::Bookkeeping => FailureRouting::Reconcile,
        SettlementErrorKind::ServiceUnavailable => {
            warn!("renewal of subscription {subscription_id} deferred: {}", failed.error);
            FailureRouting::Deferred
        }
        SettlementErrorKind::Validation | SettlementErrorKind::Rejected => {
            if let Err(err) = lifecycle
                .mark_overdue(subscription_id, &failed.error.to_string(), now)
                .await
            {
                error!("failed to mark subscription {subscription_id} overdue: {err:#}");
            }
            if let Some(handler) = handler {
                if let Err(err) = handler.handle_failure(&failed.failure, now).await {
                    error!(
                        "failed to open recovery for subscription {subscription_id}: {err:#}"
                    );
                }
            }
            FailureRouting::Overdue
        }
    }
}
