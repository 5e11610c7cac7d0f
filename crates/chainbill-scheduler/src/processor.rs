use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chainbill_core::{
    ChangeStatus, ChangeType, EngineSettings, RecordStore, ScheduledChange, ScheduledChangeStore,
    SubscriptionStore,
};
use chainbill_lifecycle::SubscriptionLifecycle;
use chainbill_settlement::{SettlementExecutor, SettlementFailureHandler, renewal_context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::failures::route_failure;
use crate::redemptions::lease_redemption;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Rows another worker claimed first.
    pub skipped: usize,
    /// Resumes whose first redemption did not settle.
    pub settlement_failures: usize,
}

/// Applies scheduled changes whose effective time has arrived.
pub struct ScheduledChangeProcessor {
    store: Arc<dyn RecordStore>,
    lifecycle: SubscriptionLifecycle,
    executor: Arc<SettlementExecutor>,
    failure_handler: Option<Arc<dyn SettlementFailureHandler>>,
    batch_size: usize,
    lease: Duration,
}

impl ScheduledChangeProcessor {
    pub fn new(executor: Arc<SettlementExecutor>, batch_size: usize) -> Self {
        let store = executor.store();
        Self {
            lifecycle: SubscriptionLifecycle::new(store.clone()),
            store,
            executor,
            failure_handler: None,
            batch_size,
            lease: EngineSettings::default().redemption_lease,
        }
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn SettlementFailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub async fn run_sweep(&self, now: DateTime<Utc>) -> anyhow::Result<ChangeSweepReport> {
        let due = self
            .store
            .list_due_changes(now, self.batch_size)
            .await
            .context("failed to load due scheduled changes")?;
        let mut report = ChangeSweepReport::default();

        for change in due {
            let claimed = self
                .store
                .transition_change(
                    change.id,
                    ChangeStatus::Scheduled,
                    ChangeStatus::Processing,
                    None,
                    now,
                )
                .await
                .with_context(|| format!("failed to claim scheduled change {}", change.id))?;
            if !claimed {
                report.skipped += 1;
                continue;
            }
            report.claimed += 1;

            let (to, message) = match self.apply(&change, now, &mut report).await {
                Ok(()) => (ChangeStatus::Completed, None),
                Err(err) => {
                    error!(
                        "scheduled {} {} for subscription {} failed: {err:#}",
                        change.change_type, change.id, change.subscription_id
                    );
                    (ChangeStatus::Failed, Some(format!("{err:#}")))
                }
            };

            let recorded = self
                .store
                .transition_change(change.id, ChangeStatus::Processing, to, message, now)
                .await;
            match recorded {
                Ok(true) if to == ChangeStatus::Completed => report.completed += 1,
                Ok(true) => report.failed += 1,
                Ok(false) => {
                    warn!("scheduled change {} left processing by another writer", change.id)
                }
                Err(err) => error!("failed to record outcome of change {}: {err:#}", change.id),
            }
        }

        info!(
            "scheduled change sweep: {} claimed, {} completed, {} failed, {} skipped",
            report.claimed, report.completed, report.failed, report.skipped
        );
        Ok(report)
    }

    async fn apply(
        &self,
        change: &ScheduledChange,
        now: DateTime<Utc>,
        report: &mut ChangeSweepReport,
    ) -> anyhow::Result<()> {
        match change.change_type {
            ChangeType::Downgrade => {
                self.lifecycle.apply_downgrade(change, now).await?;
            }
            ChangeType::Cancel => {
                self.lifecycle
                    .finalize_cancellation(change.subscription_id, "scheduled cancellation", now)
                    .await?;
            }
            ChangeType::Resume => {
                let resumed = self.lifecycle.resume(change.subscription_id, now).await?;
                let subscription = &resumed.subscription;
                if !lease_redemption(&*self.store, subscription, now, self.lease).await? {
                    info!(
                        "subscription {} resumed, its redemption is already being settled",
                        subscription.id
                    );
                    return Ok(());
                }
                let settled = match renewal_context(&*self.store, subscription).await {
                    Ok(context) => Ok(self.executor.settle(context, now).await),
                    Err(err) => Err(err),
                };
                if let Err(err) = self.store.release_redemption(subscription.id).await {
                    warn!("failed to release redemption of {}: {err:#}", subscription.id);
                }
                let settled = settled?;
                if let Err(failed) = settled {
                    report.settlement_failures += 1;
                    let routing = route_failure(
                        &self.lifecycle,
                        self.failure_handler.as_ref(),
                        change.subscription_id,
                        &failed,
                        now,
                    )
                    .await;
                    info!(
                        "subscription {} resumed but its redemption failed ({routing})",
                        change.subscription_id
                    );
                }
            }
            ChangeType::Upgrade | ChangeType::Pause => {
                anyhow::bail!(
                    "{} changes apply immediately and are never swept",
                    change.change_type
                );
            }
        }
        Ok(())
    }
}
