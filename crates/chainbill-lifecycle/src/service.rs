use std::sync::Arc;

use chainbill_core::{
    BillingError, BillingResult, CatalogStore, ChangeStatus, ChangeType, LedgerStore, LineItem,
    Product, ProrationKind, ProrationRecord, RecordStore, ScheduledChange, ScheduledChangeStore,
    StateChangeAudit, Subscription, SubscriptionEvent, SubscriptionEventKind, SubscriptionStatus,
    SubscriptionStore, line_items_total,
};
use chainbill_proration::{
    ProrationCalculation, add_billing_period, format_proration_explanation, pause_credit,
    schedule_downgrade, upgrade_proration,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::transitions::validate_transition;

#[derive(Debug, Clone)]
pub struct UpgradeOutcome {
    pub subscription: Subscription,
    pub change: ScheduledChange,
    pub proration: ProrationRecord,
    /// Net proration to settle immediately, when positive.
    pub amount_due: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct UpgradePreview {
    pub calculation: ProrationCalculation,
    pub explanation: String,
}

#[derive(Debug, Clone)]
pub struct PauseOutcome {
    pub subscription: Subscription,
    pub proration: ProrationRecord,
    pub resume_change: Option<ScheduledChange>,
}

#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub subscription: Subscription,
    /// The new period's charge, due now.
    pub amount_due: Decimal,
}

/// Drives every status change of a subscription and writes its event and audit rows.
pub struct SubscriptionLifecycle {
    store: Arc<dyn RecordStore>,
}

impl SubscriptionLifecycle {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: Uuid) -> BillingResult<Subscription> {
        self.store
            .subscription(id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", id))
    }

    pub async fn load_product(&self, id: Uuid) -> BillingResult<Product> {
        self.store
            .product(id)
            .await?
            .ok_or_else(|| BillingError::not_found("product", id))
    }

    /// Appends the event and, for every transition, the compliance audit row.
    pub async fn record_transition(
        &self,
        subscription: &Subscription,
        from: SubscriptionStatus,
        previous_amount: Decimal,
        event: SubscriptionEvent,
        reason: &str,
    ) -> BillingResult<()> {
        self.store.append_event(&event).await?;
        self.store
            .append_audit(&StateChangeAudit {
                id: Uuid::new_v4(),
                subscription_id: subscription.id,
                from_status: from,
                to_status: subscription.status,
                previous_amount,
                new_amount: subscription.amount,
                reason: reason.to_string(),
                occurred_at: event.occurred_at,
            })
            .await?;
        Ok(())
    }

    pub async fn preview_upgrade(
        &self,
        id: Uuid,
        new_items: &[LineItem],
        now: DateTime<Utc>,
    ) -> BillingResult<UpgradePreview> {
        let subscription = self.load(id).await?;
        let new_amount = validated_total(new_items)?;
        let calculation = upgrade_proration(
            subscription.current_period_start,
            subscription.current_period_end,
            subscription.amount,
            new_amount,
            now,
        )?;
        let explanation = format_proration_explanation(&calculation);

        Ok(UpgradePreview {
            calculation,
            explanation,
        })
    }

    pub async fn upgrade(
        &self,
        id: Uuid,
        new_items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> BillingResult<UpgradeOutcome> {
        let mut subscription = self.load(id).await?;
        require_status(&subscription, &[SubscriptionStatus::Active], SubscriptionStatus::Active)?;
        let new_amount = validated_total(&new_items)?;

        let cancelled_downgrade = self.cancel_pending_downgrade(id).await?;

        let calculation = upgrade_proration(
            subscription.current_period_start,
            subscription.current_period_end,
            subscription.amount,
            new_amount,
            now,
        )?;
        let proration = calculation.to_record(id, ProrationKind::Upgrade, now);
        self.store.insert_proration(&proration).await?;

        let mut change = ScheduledChange::scheduled(
            id,
            ChangeType::Upgrade,
            now,
            subscription.line_items.clone(),
            new_items.clone(),
            now,
        );
        change.proration_amount = Some(calculation.net_amount);
        change.status = ChangeStatus::Completed;
        change.processed_at = Some(now);
        self.store.insert_change(&change).await?;

        let previous_amount = subscription.amount;
        subscription.line_items = new_items;
        subscription.amount = new_amount;
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::Upgraded, now)
            .with_amount(calculation.net_amount)
            .with_payload(json!({
                "change_id": change.id,
                "proration_id": proration.id,
                "previous_amount": previous_amount,
                "new_amount": new_amount,
                "cancelled_downgrade": cancelled_downgrade,
            }));
        self.record_transition(
            &subscription,
            SubscriptionStatus::Active,
            previous_amount,
            event,
            "upgrade",
        )
        .await?;

        let amount_due = Some(calculation.amount_due()).filter(|due| *due > Decimal::ZERO);
        info!(
            "subscription {id} upgraded from {previous_amount} to {new_amount}, net proration {}",
            calculation.net_amount
        );

        Ok(UpgradeOutcome {
            subscription,
            change,
            proration,
            amount_due,
        })
    }

    pub async fn schedule_downgrade(
        &self,
        id: Uuid,
        new_items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> BillingResult<ScheduledChange> {
        let subscription = self.load(id).await?;
        require_status(&subscription, &[SubscriptionStatus::Active], SubscriptionStatus::Active)?;
        let new_amount = validated_total(&new_items)?;
        if subscription.cancel_at.is_some() {
            return Err(BillingError::Conflict(format!(
                "subscription {id} has a cancellation pending"
            )));
        }
        if self
            .pending_change(id, ChangeType::Downgrade)
            .await?
            .is_some()
        {
            return Err(BillingError::Conflict(format!(
                "subscription {id} already has a downgrade scheduled"
            )));
        }

        let effect = schedule_downgrade(subscription.current_period_end, ChangeType::Downgrade)?;
        let mut change = ScheduledChange::scheduled(
            id,
            ChangeType::Downgrade,
            effect.effective_at,
            subscription.line_items.clone(),
            new_items,
            now,
        );
        change.proration_amount = Some(effect.proration_amount);
        self.store.insert_change(&change).await?;

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::DowngradeScheduled, now)
            .with_payload(json!({
                "change_id": change.id,
                "effective_at": change.effective_at,
                "new_amount": new_amount,
            }));
        self.record_transition(
            &subscription,
            subscription.status,
            subscription.amount,
            event,
            "downgrade scheduled",
        )
        .await?;

        info!("subscription {id} downgrade scheduled for {}", change.effective_at);
        Ok(change)
    }

    /// Applies a due downgrade; only the processor calls this.
    pub async fn apply_downgrade(
        &self,
        change: &ScheduledChange,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.load(change.subscription_id).await?;
        require_status(
            &subscription,
            &[SubscriptionStatus::Active, SubscriptionStatus::Overdue],
            SubscriptionStatus::Active,
        )?;
        let new_amount = validated_total(&change.after_items)?;

        let previous_amount = subscription.amount;
        subscription.line_items = change.after_items.clone();
        subscription.amount = new_amount;
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;

        let event = SubscriptionEvent::new(subscription.id, SubscriptionEventKind::Downgraded, now)
            .with_amount(new_amount)
            .with_payload(json!({ "change_id": change.id }));
        self.record_transition(
            &subscription,
            subscription.status,
            previous_amount,
            event,
            "downgrade applied",
        )
        .await?;

        Ok(subscription)
    }

    pub async fn schedule_cancellation(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<ScheduledChange> {
        let mut subscription = self.load(id).await?;
        if subscription.status == SubscriptionStatus::Cancelled || subscription.cancel_at.is_some() {
            return Err(BillingError::Conflict(format!(
                "subscription {id} is already cancelled or cancelling"
            )));
        }
        require_status(
            &subscription,
            &[SubscriptionStatus::Active, SubscriptionStatus::Overdue],
            SubscriptionStatus::Cancelled,
        )?;

        let effect = schedule_downgrade(subscription.current_period_end, ChangeType::Cancel)?;
        let change = ScheduledChange::scheduled(
            id,
            ChangeType::Cancel,
            effect.effective_at,
            subscription.line_items.clone(),
            Vec::new(),
            now,
        );
        self.store.insert_change(&change).await?;

        subscription.cancel_at = Some(effect.effective_at);
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::CancellationScheduled, now)
            .with_payload(json!({ "change_id": change.id, "cancel_at": effect.effective_at }));
        self.record_transition(
            &subscription,
            subscription.status,
            subscription.amount,
            event,
            "cancellation scheduled",
        )
        .await?;

        info!("subscription {id} cancels at {}", effect.effective_at);
        Ok(change)
    }

    /// Withdraws a cancellation that has not started executing.
    pub async fn reactivate(&self, id: Uuid, now: DateTime<Utc>) -> BillingResult<Subscription> {
        let mut subscription = self.load(id).await?;
        if subscription.cancel_at.is_none() || subscription.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "subscription {id} has no pending cancellation"
            )));
        }

        let change = self
            .pending_change(id, ChangeType::Cancel)
            .await?
            .ok_or_else(|| {
                BillingError::Conflict(format!("cancellation of {id} is already executing"))
            })?;
        if !self.store.delete_scheduled_change(change.id).await? {
            return Err(BillingError::Conflict(format!(
                "cancellation of {id} is already executing"
            )));
        }

        subscription.cancel_at = None;
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::Reactivated, now)
            .with_payload(json!({ "change_id": change.id }));
        self.record_transition(
            &subscription,
            subscription.status,
            subscription.amount,
            event,
            "cancellation withdrawn",
        )
        .await?;

        info!("subscription {id} reactivated");
        Ok(subscription)
    }

    /// Ends the subscription now. Used once a scheduled cancellation is due and by dunning.
    pub async fn finalize_cancellation(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.load(id).await?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Ok(subscription);
        }

        let from = self.move_to(&mut subscription, SubscriptionStatus::Cancelled, now)?;
        subscription.cancel_at = Some(subscription.cancel_at.unwrap_or(now));
        subscription.pause_until = None;
        self.store.update_subscription(&subscription).await?;
        self.drop_pending_changes(id).await?;

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::Cancelled, now)
            .with_payload(json!({ "reason": reason }));
        self.record_transition(&subscription, from, subscription.amount, event, reason)
            .await?;

        info!("subscription {id} cancelled: {reason}");
        Ok(subscription)
    }

    pub async fn pause(
        &self,
        id: Uuid,
        pause_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<PauseOutcome> {
        let mut subscription = self.load(id).await?;
        require_status(&subscription, &[SubscriptionStatus::Active], SubscriptionStatus::Suspended)?;
        if pause_until.is_some_and(|until| until <= now) {
            return Err(BillingError::validation("pause_until must be in the future"));
        }

        let calculation = pause_credit(
            subscription.current_period_start,
            subscription.current_period_end,
            subscription.amount,
            now,
        )?;
        let proration = calculation.to_record(id, ProrationKind::Pause, now);
        self.store.insert_proration(&proration).await?;

        let from = self.move_to(&mut subscription, SubscriptionStatus::Suspended, now)?;
        subscription.pause_until = pause_until;
        self.store.update_subscription(&subscription).await?;

        let resume_change = match pause_until {
            Some(until) => {
                let change = ScheduledChange::scheduled(
                    id,
                    ChangeType::Resume,
                    until,
                    subscription.line_items.clone(),
                    subscription.line_items.clone(),
                    now,
                );
                self.store.insert_change(&change).await?;
                Some(change)
            }
            None => None,
        };

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::Paused, now)
            .with_amount(proration.credit_amount)
            .with_payload(json!({
                "proration_id": proration.id,
                "pause_until": pause_until,
                "resume_change_id": resume_change.as_ref().map(|change| change.id),
            }));
        self.record_transition(&subscription, from, subscription.amount, event, "pause")
            .await?;

        info!("subscription {id} paused, credit {}", proration.credit_amount);
        Ok(PauseOutcome {
            subscription,
            proration,
            resume_change,
        })
    }

    /// Starts a fresh period now. The caller settles `amount_due` immediately.
    pub async fn resume(&self, id: Uuid, now: DateTime<Utc>) -> BillingResult<ResumeOutcome> {
        let mut subscription = self.load(id).await?;
        require_status(
            &subscription,
            &[SubscriptionStatus::Suspended, SubscriptionStatus::Paused],
            SubscriptionStatus::Active,
        )?;
        let product = self.load_product(subscription.product_id).await?;
        let interval = product.billing_interval().ok_or_else(|| {
            BillingError::validation(format!("product {} does not renew", product.id))
        })?;

        let from = self.move_to(&mut subscription, SubscriptionStatus::Active, now)?;
        subscription.current_period_start = now;
        subscription.current_period_end = add_billing_period(now, interval.unit, interval.count)?;
        subscription.next_redemption_at = Some(now);
        subscription.pause_until = None;
        self.store.update_subscription(&subscription).await?;

        if let Some(change) = self.pending_change(id, ChangeType::Resume).await? {
            self.store.delete_scheduled_change(change.id).await?;
        }

        let event = SubscriptionEvent::new(id, SubscriptionEventKind::Resumed, now).with_payload(
            json!({
                "period_start": subscription.current_period_start,
                "period_end": subscription.current_period_end,
            }),
        );
        self.record_transition(&subscription, from, subscription.amount, event, "resume")
            .await?;

        info!("subscription {id} resumed");
        Ok(ResumeOutcome {
            amount_due: subscription.amount,
            subscription,
        })
    }

    pub async fn mark_overdue(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.simple_transition(
            id,
            SubscriptionStatus::Overdue,
            SubscriptionEventKind::Overdue,
            reason,
            now,
        )
        .await
    }

    /// Returns an overdue subscription to active after a successful retry.
    pub async fn recover(&self, id: Uuid, now: DateTime<Utc>) -> BillingResult<Subscription> {
        let subscription = self.load(id).await?;
        if subscription.status != SubscriptionStatus::Overdue {
            return Ok(subscription);
        }
        self.simple_transition(
            id,
            SubscriptionStatus::Active,
            SubscriptionEventKind::Recovered,
            "payment recovered",
            now,
        )
        .await
    }

    pub async fn expire(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.simple_transition(
            id,
            SubscriptionStatus::Expired,
            SubscriptionEventKind::Expired,
            reason,
            now,
        )
        .await
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        self.simple_transition(
            id,
            SubscriptionStatus::Failed,
            SubscriptionEventKind::Failed,
            reason,
            now,
        )
        .await
    }

    /// Physically removes a subscription; only terminal rows may go.
    pub async fn delete(&self, id: Uuid) -> BillingResult<()> {
        let subscription = self.load(id).await?;
        if !subscription.status.is_terminal() {
            return Err(BillingError::Conflict(format!(
                "subscription {id} is {} and cannot be deleted",
                subscription.status
            )));
        }
        self.store.delete_subscription(id).await?;
        Ok(())
    }

    async fn simple_transition(
        &self,
        id: Uuid,
        to: SubscriptionStatus,
        kind: SubscriptionEventKind,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.load(id).await?;
        if subscription.status == to {
            return Ok(subscription);
        }

        let from = self.move_to(&mut subscription, to, now)?;
        self.store.update_subscription(&subscription).await?;
        if to.is_terminal() {
            self.drop_pending_changes(id).await?;
        }

        let event =
            SubscriptionEvent::new(id, kind, now).with_payload(json!({ "reason": reason }));
        self.record_transition(&subscription, from, subscription.amount, event, reason)
            .await?;

        info!("subscription {id} moved from {from} to {to}: {reason}");
        Ok(subscription)
    }

    fn move_to(
        &self,
        subscription: &mut Subscription,
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionStatus> {
        let from = subscription.status;
        validate_transition(from, to)?;

        subscription.status = to;
        subscription.updated_at = now;
        if !to.accrues_redemptions() {
            subscription.next_redemption_at = None;
        }
        Ok(from)
    }

    async fn pending_change(
        &self,
        subscription_id: Uuid,
        change_type: ChangeType,
    ) -> BillingResult<Option<ScheduledChange>> {
        Ok(self
            .store
            .changes_for_subscription(subscription_id)
            .await?
            .into_iter()
            .find(|change| {
                change.change_type == change_type && change.status == ChangeStatus::Scheduled
            }))
    }

    /// Drops the downgrade an upgrade supersedes. One the processor already claimed is a
    /// conflict, since it would replace the upgraded items at period end.
    async fn cancel_pending_downgrade(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Uuid>> {
        let downgrade = self
            .store
            .changes_for_subscription(subscription_id)
            .await?
            .into_iter()
            .find(|change| {
                change.change_type == ChangeType::Downgrade
                    && matches!(change.status, ChangeStatus::Scheduled | ChangeStatus::Processing)
            });
        let Some(downgrade) = downgrade else {
            return Ok(None);
        };

        if !self.store.delete_scheduled_change(downgrade.id).await? {
            return Err(BillingError::Conflict(format!(
                "downgrade of {subscription_id} is already executing"
            )));
        }
        info!("subscription {subscription_id} downgrade {} cancelled by upgrade", downgrade.id);
        Ok(Some(downgrade.id))
    }

    async fn drop_pending_changes(&self, subscription_id: Uuid) -> BillingResult<()> {
        for change in self.store.changes_for_subscription(subscription_id).await? {
            if change.status == ChangeStatus::Scheduled {
                self.store.delete_scheduled_change(change.id).await?;
            }
        }
        Ok(())
    }
}

fn require_status(
    subscription: &Subscription,
    allowed: &[SubscriptionStatus],
    to: SubscriptionStatus,
) -> BillingResult<()> {
    if allowed.contains(&subscription.status) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: subscription.status,
            to,
        })
    }
}

fn validated_total(items: &[LineItem]) -> BillingResult<Decimal> {
    if items.is_empty() {
        return Err(BillingError::validation("at least one line item is required"));
    }
    if items
        .iter()
        .any(|item| item.quantity == 0 || item.unit_amount < Decimal::ZERO)
    {
        return Err(BillingError::validation(
            "line items need a positive quantity and a non-negative price",
        ));
    }
    Ok(line_items_total(items))
}
