use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainbill_core::{
    AttemptStatus, CampaignTarget, CatalogStore, DunningAction, DunningCampaign, LedgerStore,
    RecordStore, SettlementErrorKind, SubscriptionStatus, SubscriptionStore,
};
use chainbill_settlement::{SettlementExecutor, renewal_context};
use chainbill_tools::{Notification, NotificationChannel, NotificationSender};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub status: AttemptStatus,
    pub detail: Option<String>,
    /// The failed payment is now settled.
    pub recovered: bool,
}

impl ActionOutcome {
    pub fn succeeded(detail: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Succeeded,
            detail: Some(detail.into()),
            recovered: false,
        }
    }

    pub fn recovered(detail: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Succeeded,
            detail: Some(detail.into()),
            recovered: true,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: AttemptStatus::Failed,
            detail: Some(detail.into()),
            recovered: false,
        }
    }
}

#[async_trait]
pub trait DunningActionHandler: Send + Sync {
    async fn execute(
        &self,
        campaign: &DunningCampaign,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ActionOutcome>;
}

/// Maps each configured action to the handler that performs it.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<DunningAction, Arc<dyn DunningActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payment retries through `executor`, email and in-app reminders through `notifier`.
    pub fn standard(
        executor: Arc<SettlementExecutor>,
        notifier: Arc<dyn NotificationSender>,
        notification_timeout: Duration,
    ) -> Self {
        let store = executor.store();
        Self::new()
            .register(
                DunningAction::RetryPayment,
                Arc::new(RetryPaymentAction::new(executor)),
            )
            .register(
                DunningAction::Email,
                Arc::new(NotifyAction::new(
                    NotificationChannel::Email,
                    store.clone(),
                    notifier.clone(),
                    notification_timeout,
                )),
            )
            .register(
                DunningAction::InApp,
                Arc::new(NotifyAction::new(
                    NotificationChannel::InApp,
                    store,
                    notifier,
                    notification_timeout,
                )),
            )
    }

    pub fn register(
        mut self,
        action: DunningAction,
        handler: Arc<dyn DunningActionHandler>,
    ) -> Self {
        self.handlers.insert(action, handler);
        self
    }

    pub fn handler(&self, action: DunningAction) -> Option<Arc<dyn DunningActionHandler>> {
        self.handlers.get(&action).cloned()
    }
}

/// Re-attempts the failed payment with the same logical redemption.
pub struct RetryPaymentAction {
    executor: Arc<SettlementExecutor>,
    store: Arc<dyn RecordStore>,
}

impl RetryPaymentAction {
    pub fn new(executor: Arc<SettlementExecutor>) -> Self {
        Self {
            store: executor.store(),
            executor,
        }
    }
}

#[async_trait]
impl DunningActionHandler for RetryPaymentAction {
    async fn execute(
        &self,
        campaign: &DunningCampaign,
        _attempt_number: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ActionOutcome> {
        let context = match &campaign.target {
            CampaignTarget::Subscription { subscription_id } => {
                let Some(subscription) = self.store.subscription(*subscription_id).await? else {
                    return Ok(ActionOutcome::failed("subscription no longer exists"));
                };
                match subscription.status {
                    SubscriptionStatus::Active => {
                        return Ok(ActionOutcome::recovered("subscription is already active"));
                    }
                    SubscriptionStatus::Overdue => {}
                    other => {
                        return Ok(ActionOutcome::failed(format!("subscription is {other}")));
                    }
                }
                renewal_context(&*self.store, &subscription).await?
            }
            CampaignTarget::OneTimePayment { failure_id } => {
                let Some(failure) = self.store.failure(*failure_id).await? else {
                    return Ok(ActionOutcome::failed("original failure record is missing"));
                };
                failure.context
            }
        };

        match self.executor.settle(context, now).await {
            Ok(outcome) => Ok(ActionOutcome::recovered(format!(
                "settled as {}",
                outcome.transaction_ref
            ))),
            Err(failed) if failed.kind() == SettlementErrorKind::Bookkeeping => {
                Ok(ActionOutcome::recovered(failed.error.to_string()))
            }
            Err(failed) => Ok(ActionOutcome::failed(failed.error.to_string())),
        }
    }
}

/// Sends a payment reminder on one channel.
pub struct NotifyAction {
    channel: NotificationChannel,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn NotificationSender>,
    timeout: Duration,
}

impl NotifyAction {
    pub fn new(
        channel: NotificationChannel,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn NotificationSender>,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            store,
            notifier,
            timeout,
        }
    }
}

#[async_trait]
impl DunningActionHandler for NotifyAction {
    async fn execute(
        &self,
        campaign: &DunningCampaign,
        attempt_number: u32,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<ActionOutcome> {
        let Some(customer) = self.store.customer(campaign.customer_id).await? else {
            return Ok(ActionOutcome::failed("customer not found"));
        };
        let recipient = match self.channel {
            NotificationChannel::Email => Some(customer.email),
            NotificationChannel::InApp => customer.in_app_handle,
        };
        let Some(recipient) = recipient else {
            return Ok(ActionOutcome::failed("customer has no in-app handle"));
        };

        let notification = Notification {
            channel: self.channel,
            template: "payment_recovery_reminder".to_string(),
            recipient,
            data: json!({
                "campaign_id": campaign.id,
                "attempt_number": attempt_number,
                "amount": campaign.original_amount,
                "currency": campaign.currency,
                "next_retry_at": campaign.next_retry_at,
                "subscription_id": campaign.target.subscription_id(),
            }),
        };

        match tokio::time::timeout(self.timeout, self.notifier.send(&notification)).await {
            Ok(Ok(())) => Ok(ActionOutcome::succeeded(format!(
                "reminder sent to {}",
                notification.recipient
            ))),
            Ok(Err(err)) => {
                warn!("reminder for campaign {} was not delivered: {err:#}", campaign.id);
                Ok(ActionOutcome::failed(format!("{err:#}")))
            }
            Err(_) => Ok(ActionOutcome::failed(format!(
                "notification timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
