use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chainbill_core::{
    BillingResult, CatalogStore, EngineSettings, RecordStore, Subscription, SubscriptionStore,
};
use chainbill_lifecycle::{SubscriptionLifecycle, UpgradeOutcome};
use chainbill_settlement::{
    SettlementExecutor, SettlementFailureHandler, SettlementOutcome, proration_context,
    renewal_context,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::failures::{FailureRouting, route_failure};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionSweepReport {
    pub due: usize,
    pub settled: usize,
    /// Cancellation takes effect before the redemption.
    pub skipped: usize,
    pub expired: usize,
    pub overdue: usize,
    /// Execution service unavailable; retried on the next sweep.
    pub deferred: usize,
    /// Funds moved but bookkeeping is unfinished.
    pub unreconciled: usize,
    /// Held by a concurrent sweep, or already settled by one.
    pub contended: usize,
    pub errors: usize,
}

/// Settles every active subscription whose next redemption is due.
pub struct RedemptionSweep {
    store: Arc<dyn RecordStore>,
    lifecycle: SubscriptionLifecycle,
    executor: Arc<SettlementExecutor>,
    failure_handler: Option<Arc<dyn SettlementFailureHandler>>,
    batch_size: usize,
    lease: Duration,
}

impl RedemptionSweep {
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

    pub async fn run_sweep(&self, now: DateTime<Utc>) -> anyhow::Result<RedemptionSweepReport> {
        let due = self
            .store
            .list_due_subscriptions(now, self.batch_size)
            .await
            .context("failed to load due subscriptions")?;
        let mut report = RedemptionSweepReport {
            due: due.len(),
            ..Default::default()
        };

        for subscription in due {
            let claimed = lease_redemption(&*self.store, &subscription, now, self.lease).await;
            match claimed {
                Ok(true) => {}
                Ok(false) => {
                    report.contended += 1;
                    continue;
                }
                Err(err) => {
                    error!("failed to claim subscription {}: {err:#}", subscription.id);
                    report.errors += 1;
                    continue;
                }
            }

            let result = self.redeem(&subscription, now, &mut report).await;
            if let Err(err) = self.store.release_redemption(subscription.id).await {
                warn!("failed to release subscription {}: {err:#}", subscription.id);
            }
            if let Err(err) = result {
                error!(
                    "failed to process redemption for subscription {}: {err:#}",
                    subscription.id
                );
                report.errors += 1;
            }
        }

        info!(
            "redemption sweep: {} due, {} settled, {} overdue, {} expired, {} deferred",
            report.due, report.settled, report.overdue, report.expired, report.deferred
        );
        Ok(report)
    }

    async fn redeem(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        report: &mut RedemptionSweepReport,
    ) -> BillingResult<()> {
        let due_at = subscription.next_redemption_at.unwrap_or(now);
        if subscription.cancel_at.is_some_and(|cancel_at| cancel_at <= due_at) {
            report.skipped += 1;
            return Ok(());
        }

        let delegation = self.store.delegation(subscription.delegation_id).await?;
        if delegation.is_none_or(|delegation| delegation.is_expired(now)) {
            self.lifecycle
                .expire(subscription.id, "delegation expired", now)
                .await?;
            report.expired += 1;
            return Ok(());
        }

        let context = renewal_context(&*self.store, subscription).await?;
        match self.executor.settle(context, now).await {
            Ok(_) => report.settled += 1,
            Err(failed) => {
                let routing = route_failure(
                    &self.lifecycle,
                    self.failure_handler.as_ref(),
                    subscription.id,
                    &failed,
                    now,
                )
                .await;
                match routing {
                    FailureRouting::Overdue => report.overdue += 1,
                    FailureRouting::Deferred => report.deferred += 1,
                    FailureRouting::Reconcile => report.unreconciled += 1,
                }
            }
        }
        Ok(())
    }
}

/// Leases the subscription's due redemption so no other sweep settles it concurrently.
pub(crate) async fn lease_redemption(
    store: &dyn RecordStore,
    subscription: &Subscription,
    now: DateTime<Utc>,
    lease: Duration,
) -> anyhow::Result<bool> {
    let Some(due_at) = subscription.next_redemption_at else {
        return Ok(false);
    };
    let lease = TimeDelta::from_std(lease).context("redemption lease out of range")?;
    store
        .claim_redemption(subscription.id, due_at, now, now + lease)
        .await
}

/// Settles an upgrade's net proration right away. Returns `None` when nothing is due.
pub async fn charge_proration(
    executor: &SettlementExecutor,
    upgrade: &UpgradeOutcome,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<SettlementOutcome>> {
    let Some(amount) = upgrade.amount_due else {
        return Ok(None);
    };
    let store = executor.store();
    let context =
        proration_context(&*store, &upgrade.subscription, upgrade.change.id, amount).await?;
    let outcome = executor.settle(context, now).await?;
    Ok(Some(outcome))
}
