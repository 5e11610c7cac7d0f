use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chainbill_core::{
    CampaignStatus, CampaignTarget, CatalogStore, ChangeStatus, Customer, Delegation,
    DunningAttempt, DunningCampaign, DunningConfiguration, DunningStore, Invoice, LedgerStore,
    Payment, Product, ProrationRecord, ScheduledChange, ScheduledChangeStore, SettlementFailure,
    SettlementReceipt, StateChangeAudit, Subscription, SubscriptionEvent, SubscriptionEventKind,
    SubscriptionStatus, SubscriptionStore,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Writes that tests can make fail once, to exercise partial-failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertSubscription,
    UpdateSubscription,
    AppendEvent,
    InsertPayment,
    TouchWallet,
    InsertInvoice,
    SaveReceipt,
}

#[derive(Default)]
struct Tables {
    products: HashMap<Uuid, Product>,
    delegations: HashMap<Uuid, Delegation>,
    customers: HashMap<Uuid, Customer>,
    wallet_usage: HashMap<(String, String), DateTime<Utc>>,
    subscriptions: HashMap<Uuid, Subscription>,
    redemption_leases: HashMap<Uuid, DateTime<Utc>>,
    changes: HashMap<Uuid, ScheduledChange>,
    events: Vec<SubscriptionEvent>,
    audits: Vec<StateChangeAudit>,
    prorations: Vec<ProrationRecord>,
    payments: Vec<Payment>,
    invoices: Vec<Invoice>,
    receipts: HashMap<String, SettlementReceipt>,
    failures: Vec<SettlementFailure>,
    dunning_configs: HashMap<Uuid, DunningConfiguration>,
    campaigns: HashMap<Uuid, DunningCampaign>,
    attempts: Vec<DunningAttempt>,
}

/// Record store held entirely in memory. Every conditional update runs under one write lock,
/// which gives the same all-or-nothing behaviour as a single conditional `UPDATE`.
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    fail_points: RwLock<HashSet<FailPoint>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write at `point` fail.
    pub async fn fail_next(&self, point: FailPoint) {
        self.fail_points.write().await.insert(point);
    }

    async fn check(&self, point: FailPoint) -> anyhow::Result<()> {
        if self.fail_points.write().await.remove(&point) {
            anyhow::bail!("injected failure at {point:?}");
        }
        Ok(())
    }

    pub async fn put_product(&self, product: Product) {
        self.tables.write().await.products.insert(product.id, product);
    }

    pub async fn put_delegation(&self, delegation: Delegation) {
        self.tables
            .write()
            .await
            .delegations
            .insert(delegation.id, delegation);
    }

    pub async fn put_customer(&self, customer: Customer) {
        self.tables.write().await.customers.insert(customer.id, customer);
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.tables.read().await.payments.clone()
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        self.tables.read().await.invoices.clone()
    }

    pub async fn wallet_last_used(
        &self,
        wallet_address: &str,
        network_id: &str,
    ) -> Option<DateTime<Utc>> {
        self.tables
            .read()
            .await
            .wallet_usage
            .get(&(wallet_address.to_string(), network_id.to_string()))
            .copied()
    }
}

#[async_trait]
impl CatalogStore for InMemoryRecordStore {
    async fn product(&self, id: Uuid) -> anyhow::Result<Option<Product>> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn delegation(&self, id: Uuid) -> anyhow::Result<Option<Delegation>> {
        Ok(self.tables.read().await.delegations.get(&id).cloned())
    }

    async fn customer(&self, id: Uuid) -> anyhow::Result<Option<Customer>> {
        Ok(self.tables.read().await.customers.get(&id).cloned())
    }

    async fn touch_wallet(
        &self,
        wallet_address: &str,
        network_id: &str,
        used_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.check(FailPoint::TouchWallet).await?;
        let mut tables = self.tables.write().await;
        let entry = tables
            .wallet_usage
            .entry((wallet_address.to_string(), network_id.to_string()))
            .or_insert(used_at);
        if *entry < used_at {
            *entry = used_at;
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryRecordStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> anyhow::Result<bool> {
        self.check(FailPoint::InsertSubscription).await?;
        let mut tables = self.tables.write().await;
        if tables.subscriptions.contains_key(&subscription.id) {
            return Ok(false);
        }
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(true)
    }

    async fn subscription(&self, id: Uuid) -> anyhow::Result<Option<Subscription>> {
        Ok(self.tables.read().await.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> anyhow::Result<()> {
        self.check(FailPoint::UpdateSubscription).await?;
        let mut tables = self.tables.write().await;
        match tables.subscriptions.get_mut(&subscription.id) {
            Some(existing) => {
                *existing = subscription.clone();
                Ok(())
            }
            None => anyhow::bail!("subscription {} does not exist", subscription.id),
        }
    }

    async fn delete_subscription(&self, id: Uuid) -> anyhow::Result<bool> {
        Ok(self.tables.write().await.subscriptions.remove(&id).is_some())
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut due: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|subscription| subscription.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|subscription| subscription.next_redemption_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_redemption(
        &self,
        id: Uuid,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let still_due = tables.subscriptions.get(&id).is_some_and(|subscription| {
            subscription.status == SubscriptionStatus::Active
                && subscription.next_redemption_at == Some(due_at)
        });
        let held = tables
            .redemption_leases
            .get(&id)
            .is_some_and(|leased_until| *leased_until > now);
        if !still_due || held {
            return Ok(false);
        }
        tables.redemption_leases.insert(id, until);
        Ok(true)
    }

    async fn release_redemption(&self, id: Uuid) -> anyhow::Result<()> {
        self.tables.write().await.redemption_leases.remove(&id);
        Ok(())
    }

    async fn list_workspace_subscriptions(
        &self,
        workspace_id: Uuid,
    ) -> anyhow::Result<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|subscription| subscription.workspace_id == workspace_id)
            .cloned()
            .collect();
        rows.sort_by_key(|subscription| subscription.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl ScheduledChangeStore for InMemoryRecordStore {
    async fn insert_change(&self, change: &ScheduledChange) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .changes
            .insert(change.id, change.clone());
        Ok(())
    }

    async fn change(&self, id: Uuid) -> anyhow::Result<Option<ScheduledChange>> {
        Ok(self.tables.read().await.changes.get(&id).cloned())
    }

    async fn list_due_changes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledChange>> {
        let tables = self.tables.read().await;
        let mut due: Vec<ScheduledChange> = tables
            .changes
            .values()
            .filter(|change| change.status == ChangeStatus::Scheduled && change.effective_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|change| (change.effective_at, change.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn changes_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Vec<ScheduledChange>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ScheduledChange> = tables
            .changes
            .values()
            .filter(|change| change.subscription_id == subscription_id)
            .cloned()
            .collect();
        rows.sort_by_key(|change| change.created_at);
        Ok(rows)
    }

    async fn transition_change(
        &self,
        id: Uuid,
        from: ChangeStatus,
        to: ChangeStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(change) = tables.changes.get_mut(&id) else {
            return Ok(false);
        };
        if change.status != from {
            return Ok(false);
        }

        change.status = to;
        change.error_message = error_message;
        if matches!(to, ChangeStatus::Completed | ChangeStatus::Failed) {
            change.processed_at = Some(at);
        }
        Ok(true)
    }

    async fn delete_scheduled_change(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let still_scheduled = tables
            .changes
            .get(&id)
            .is_some_and(|change| change.status == ChangeStatus::Scheduled);
        if still_scheduled {
            tables.changes.remove(&id);
        }
        Ok(still_scheduled)
    }
}

#[async_trait]
impl LedgerStore for InMemoryRecordStore {
    async fn append_event(&self, event: &SubscriptionEvent) -> anyhow::Result<()> {
        self.check(FailPoint::AppendEvent).await?;
        self.tables.write().await.events.push(event.clone());
        Ok(())
    }

    async fn events_for(&self, subscription_id: Uuid) -> anyhow::Result<Vec<SubscriptionEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|event| event.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn has_settlement_event(
        &self,
        subscription_id: Uuid,
        transaction_ref: &str,
    ) -> anyhow::Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.events.iter().any(|event| {
            event.subscription_id == subscription_id
                && event.kind == SubscriptionEventKind::Redeemed
                && event.transaction_ref.as_deref() == Some(transaction_ref)
        }))
    }

    async fn append_audit(&self, audit: &StateChangeAudit) -> anyhow::Result<()> {
        self.tables.write().await.audits.push(audit.clone());
        Ok(())
    }

    async fn audits_for(&self, subscription_id: Uuid) -> anyhow::Result<Vec<StateChangeAudit>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audits
            .iter()
            .filter(|audit| audit.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn insert_proration(&self, record: &ProrationRecord) -> anyhow::Result<()> {
        self.tables.write().await.prorations.push(record.clone());
        Ok(())
    }

    async fn prorations_for(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Vec<ProrationRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .prorations
            .iter()
            .filter(|record| record.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: &Payment) -> anyhow::Result<bool> {
        self.check(FailPoint::InsertPayment).await?;
        let mut tables = self.tables.write().await;
        if tables
            .payments
            .iter()
            .any(|existing| existing.transaction_ref == payment.transaction_ref)
        {
            return Ok(false);
        }
        tables.payments.push(payment.clone());
        Ok(true)
    }

    async fn payment_by_transaction(
        &self,
        transaction_ref: &str,
    ) -> anyhow::Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .find(|payment| payment.transaction_ref == transaction_ref)
            .cloned())
    }

    async fn uninvoiced_payments(&self, limit: usize) -> anyhow::Result<Vec<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .iter()
            .filter(|payment| payment.invoice_id.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> anyhow::Result<bool> {
        self.check(FailPoint::InsertInvoice).await?;
        let mut tables = self.tables.write().await;
        let duplicate = tables.invoices.iter().any(|existing| {
            existing.payment_id == invoice.payment_id
                || (invoice.purpose.advances_period()
                    && existing.purpose.advances_period()
                    && invoice.subscription_id.is_some()
                    && invoice.period_start.is_some()
                    && existing.subscription_id == invoice.subscription_id
                    && existing.period_start == invoice.period_start)
        });
        if duplicate {
            return Ok(false);
        }
        tables.invoices.push(invoice.clone());
        Ok(true)
    }

    async fn invoice_for_payment(&self, payment_id: Uuid) -> anyhow::Result<Option<Invoice>> {
        let tables = self.tables.read().await;
        Ok(tables
            .invoices
            .iter()
            .find(|invoice| invoice.payment_id == payment_id)
            .cloned())
    }

    async fn link_invoice(&self, payment_id: Uuid, invoice_id: Uuid) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        match tables.payments.iter_mut().find(|payment| payment.id == payment_id) {
            Some(payment) => {
                payment.invoice_id = Some(invoice_id);
                Ok(())
            }
            None => anyhow::bail!("payment {payment_id} does not exist"),
        }
    }

    async fn receipt(&self, idempotency_key: &str) -> anyhow::Result<Option<SettlementReceipt>> {
        Ok(self.tables.read().await.receipts.get(idempotency_key).cloned())
    }

    async fn save_receipt(&self, receipt: &SettlementReceipt) -> anyhow::Result<()> {
        self.check(FailPoint::SaveReceipt).await?;
        self.tables
            .write()
            .await
            .receipts
            .insert(receipt.idempotency_key.clone(), receipt.clone());
        Ok(())
    }

    async fn incomplete_receipts(&self, limit: usize) -> anyhow::Result<Vec<SettlementReceipt>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<SettlementReceipt> = tables
            .receipts
            .values()
            .filter(|receipt| !receipt.completed)
            .cloned()
            .collect();
        rows.sort_by_key(|receipt| receipt.submitted_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_failure(&self, failure: &SettlementFailure) -> anyhow::Result<()> {
        self.tables.write().await.failures.push(failure.clone());
        Ok(())
    }

    async fn failure(&self, id: Uuid) -> anyhow::Result<Option<SettlementFailure>> {
        let tables = self.tables.read().await;
        Ok(tables.failures.iter().find(|failure| failure.id == id).cloned())
    }

    async fn failures_for_key(
        &self,
        idempotency_key: &str,
    ) -> anyhow::Result<Vec<SettlementFailure>> {
        let tables = self.tables.read().await;
        Ok(tables
            .failures
            .iter()
            .filter(|failure| failure.idempotency_key == idempotency_key)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DunningStore for InMemoryRecordStore {
    async fn dunning_configuration(
        &self,
        workspace_id: Uuid,
    ) -> anyhow::Result<Option<DunningConfiguration>> {
        Ok(self
            .tables
            .read()
            .await
            .dunning_configs
            .get(&workspace_id)
            .cloned())
    }

    async fn put_dunning_configuration(
        &self,
        config: &DunningConfiguration,
    ) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .dunning_configs
            .insert(config.workspace_id, config.clone());
        Ok(())
    }

    async fn insert_campaign(&self, campaign: &DunningCampaign) -> anyhow::Result<()> {
        self.tables
            .write()
            .await
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn campaign(&self, id: Uuid) -> anyhow::Result<Option<DunningCampaign>> {
        Ok(self.tables.read().await.campaigns.get(&id).cloned())
    }

    async fn active_campaign_for(
        &self,
        target: &CampaignTarget,
    ) -> anyhow::Result<Option<DunningCampaign>> {
        let tables = self.tables.read().await;
        Ok(tables
            .campaigns
            .values()
            .find(|campaign| campaign.status == CampaignStatus::Active && &campaign.target == target)
            .cloned())
    }

    async fn list_due_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<DunningCampaign>> {
        let tables = self.tables.read().await;
        let mut due: Vec<DunningCampaign> = tables
            .campaigns
            .values()
            .filter(|campaign| {
                campaign.status == CampaignStatus::Active
                    && campaign.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|campaign| campaign.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update_campaign_if(
        &self,
        expected_attempt: u32,
        campaign: &DunningCampaign,
    ) -> anyhow::Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(stored) = tables.campaigns.get_mut(&campaign.id) else {
            return Ok(false);
        };
        if stored.status != CampaignStatus::Active || stored.current_attempt != expected_attempt {
            return Ok(false);
        }
        *stored = campaign.clone();
        Ok(true)
    }

    async fn append_attempt(&self, attempt: &DunningAttempt) -> anyhow::Result<()> {
        self.tables.write().await.attempts.push(attempt.clone());
        Ok(())
    }

    async fn attempts_for(&self, campaign_id: Uuid) -> anyhow::Result<Vec<DunningAttempt>> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|attempt| attempt.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}
