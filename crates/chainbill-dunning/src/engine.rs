use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chainbill_core::{
    AttemptStatus, BillingError, BillingResult, CampaignStatus, CampaignTarget, DunningAction,
    DunningAttempt, DunningCampaign, DunningConfiguration, DunningStore, EngineSettings,
    FinalAction, RecordStore, SettlementErrorKind, SettlementFailure, SettlementPurpose,
    SubscriptionStore,
};
use chainbill_lifecycle::SubscriptionLifecycle;
use chainbill_settlement::SettlementFailureHandler;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::{ActionOutcome, ActionRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DunningSweepReport {
    pub due: usize,
    pub attempted: usize,
    pub recovered: usize,
    pub exhausted: usize,
    /// Campaigns another worker evaluated first.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Evaluation {
    Skipped,
    Attempted { recovered: bool },
    Exhausted,
}

pub struct DunningEngine {
    store: Arc<dyn RecordStore>,
    lifecycle: SubscriptionLifecycle,
    registry: ActionRegistry,
    batch_size: usize,
    concurrency: usize,
}

impl DunningEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: ActionRegistry,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            lifecycle: SubscriptionLifecycle::new(store.clone()),
            store,
            registry,
            batch_size: settings.batch_size,
            concurrency: settings.dunning_concurrency.max(1),
        }
    }

    async fn configuration(&self, workspace_id: Uuid) -> BillingResult<DunningConfiguration> {
        let config = self
            .store
            .dunning_configuration(workspace_id)
            .await?
            .ok_or_else(|| {
                BillingError::Configuration(format!(
                    "workspace {workspace_id} has no dunning configuration"
                ))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Starts recovery for a failed settlement, or returns the campaign already running for the
    /// same target. Failures that moved funds, and checkouts that never created a subscription,
    /// get no campaign.
    pub async fn open_campaign(
        &self,
        failure: &SettlementFailure,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<DunningCampaign>> {
        if failure.kind == SettlementErrorKind::Bookkeeping {
            return Ok(None);
        }
        let context = &failure.context;
        let target = match (context.purpose, context.subscription_id) {
            (SettlementPurpose::Initial, _) => return Ok(None),
            (SettlementPurpose::OneTime, _) => CampaignTarget::OneTimePayment {
                failure_id: failure.id,
            },
            (_, Some(subscription_id)) => CampaignTarget::Subscription { subscription_id },
            (_, None) => {
                return Err(BillingError::validation(format!(
                    "failure {} has no subscription to recover",
                    failure.id
                )));
            }
        };

        if let Some(existing) = self.store.active_campaign_for(&target).await? {
            return Ok(Some(existing));
        }

        let config = self.configuration(context.workspace_id).await?;
        if config.retry_interval_days.is_empty() {
            return Err(BillingError::Configuration(
                "no retry interval configured".to_string(),
            ));
        }
        let first_retry_at = config.retry_after(0, failure.occurred_at)?;
        let campaign = DunningCampaign {
            id: Uuid::new_v4(),
            workspace_id: context.workspace_id,
            customer_id: context.customer_id,
            target,
            original_amount: context.amount,
            currency: context.currency.clone(),
            current_attempt: 0,
            last_retry_at: None,
            next_retry_at: Some(first_retry_at),
            status: CampaignStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_campaign(&campaign).await?;

        info!(
            "opened dunning campaign {} for {} {}, first retry at {:?}",
            campaign.id, campaign.original_amount, campaign.currency, campaign.next_retry_at
        );
        Ok(Some(campaign))
    }

    /// Evaluates every due campaign, a bounded number at a time. One campaign's failure never
    /// stops the others.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> anyhow::Result<DunningSweepReport> {
        let due = self
            .store
            .list_due_campaigns(now, self.batch_size)
            .await
            .context("failed to load due dunning campaigns")?;
        let mut report = DunningSweepReport {
            due: due.len(),
            ..Default::default()
        };

        let results: Vec<(Uuid, BillingResult<Evaluation>)> = stream::iter(due)
            .map(|campaign| async move {
                let id = campaign.id;
                (id, self.evaluate(campaign, now).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (campaign_id, result) in results {
            match result {
                Ok(Evaluation::Skipped) => report.skipped += 1,
                Ok(Evaluation::Attempted { recovered }) => {
                    report.attempted += 1;
                    if recovered {
                        report.recovered += 1;
                    }
                }
                Ok(Evaluation::Exhausted) => report.exhausted += 1,
                Err(err) => {
                    error!("failed to evaluate dunning campaign {campaign_id}: {err:#}");
                    report.errors += 1;
                }
            }
        }

        info!(
            "dunning sweep: {} due, {} attempted, {} recovered, {} exhausted",
            report.due, report.attempted, report.recovered, report.exhausted
        );
        Ok(report)
    }

    async fn evaluate(
        &self,
        campaign: DunningCampaign,
        now: DateTime<Utc>,
    ) -> BillingResult<Evaluation> {
        let config = self.configuration(campaign.workspace_id).await?;
        if campaign.current_attempt >= config.max_attempts {
            return self.exhaust(campaign, config.final_action, now).await;
        }

        let attempt_number = campaign.current_attempt + 1;
        let mut claimed = campaign.clone();
        claimed.current_attempt = attempt_number;
        claimed.last_retry_at = Some(now);
        claimed.next_retry_at = Some(config.retry_after(attempt_number as usize, now)?);
        claimed.updated_at = now;
        if !self
            .store
            .update_campaign_if(campaign.current_attempt, &claimed)
            .await?
        {
            return Ok(Evaluation::Skipped);
        }

        let recovered = self
            .run_actions(&claimed, attempt_number, config.actions_for(attempt_number), now)
            .await?;
        if recovered {
            self.recover(claimed, now).await?;
        }
        Ok(Evaluation::Attempted { recovered })
    }

    /// Runs the attempt's actions, retries first. Reminders are skipped once the payment
    /// settles.
    async fn run_actions(
        &self,
        campaign: &DunningCampaign,
        attempt_number: u32,
        mut actions: Vec<DunningAction>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        actions.sort();
        actions.dedup();

        let mut recovered = false;
        for action in actions {
            if recovered && action != DunningAction::RetryPayment {
                break;
            }

            let outcome = match self.registry.handler(action) {
                Some(handler) => handler
                    .execute(campaign, attempt_number, now)
                    .await
                    .unwrap_or_else(|err| ActionOutcome::failed(format!("{err:#}"))),
                None => ActionOutcome::failed(format!("no handler for {}", action.as_str())),
            };
            recovered |= outcome.recovered;

            self.store
                .append_attempt(&DunningAttempt {
                    id: Uuid::new_v4(),
                    campaign_id: campaign.id,
                    attempt_number,
                    action,
                    status: outcome.status,
                    detail: outcome.detail,
                    completed_at: now,
                })
                .await?;
            if outcome.status == AttemptStatus::Failed {
                warn!(
                    "dunning campaign {} attempt {attempt_number} {} failed",
                    campaign.id,
                    action.as_str()
                );
            }
        }
        Ok(recovered)
    }

    async fn recover(
        &self,
        mut campaign: DunningCampaign,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let expected = campaign.current_attempt;
        campaign.status = CampaignStatus::Recovered;
        campaign.next_retry_at = None;
        campaign.updated_at = now;
        if !self.store.update_campaign_if(expected, &campaign).await? {
            warn!("dunning campaign {} changed while recovering", campaign.id);
        }

        if let Some(subscription_id) = campaign.target.subscription_id() {
            self.lifecycle.recover(subscription_id, now).await?;
        }
        info!("dunning campaign {} recovered", campaign.id);
        Ok(())
    }

    async fn exhaust(
        &self,
        mut campaign: DunningCampaign,
        final_action: FinalAction,
        now: DateTime<Utc>,
    ) -> BillingResult<Evaluation> {
        // Closing the campaign last keeps a failed final action due for the next sweep.
        if let Some(subscription_id) = campaign.target.subscription_id() {
            self.run_final_action(subscription_id, final_action, now).await?;
        }

        let expected = campaign.current_attempt;
        campaign.status = CampaignStatus::Failed;
        campaign.next_retry_at = None;
        campaign.updated_at = now;
        if !self.store.update_campaign_if(expected, &campaign).await? {
            return Ok(Evaluation::Skipped);
        }

        info!(
            "dunning campaign {} exhausted after {} attempts",
            campaign.id, campaign.current_attempt
        );
        Ok(Evaluation::Exhausted)
    }

    /// Applies the policy's final action unless the subscription already reached a terminal
    /// status, possibly through a concurrent sweep.
    async fn run_final_action(
        &self,
        subscription_id: Uuid,
        final_action: FinalAction,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        if self.is_closed(subscription_id).await? {
            return Ok(());
        }

        let applied = match final_action {
            FinalAction::MarkFailed => {
                self.lifecycle
                    .mark_failed(subscription_id, "payment recovery exhausted", now)
                    .await
            }
            FinalAction::Cancel => {
                self.lifecycle
                    .finalize_cancellation(subscription_id, "payment recovery exhausted", now)
                    .await
            }
        };
        match applied {
            Ok(_) => Ok(()),
            Err(_) if self.is_closed(subscription_id).await? => Ok(()),
            Err(err) => {
                warn!(
                    "final action {final_action:?} for subscription {subscription_id} failed, \
                     recovery stays open: {err}"
                );
                Err(err)
            }
        }
    }

    async fn is_closed(&self, subscription_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .store
            .subscription(subscription_id)
            .await?
            .is_none_or(|subscription| subscription.status.is_terminal()))
    }
}

#[async_trait]
impl SettlementFailureHandler for DunningEngine {
    async fn handle_failure(
        &self,
        failure: &SettlementFailure,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.open_campaign(failure, now).await?;
        Ok(())
    }
}
