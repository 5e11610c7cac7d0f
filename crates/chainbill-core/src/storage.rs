use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dunning::{CampaignTarget, DunningAttempt, DunningCampaign, DunningConfiguration};
use crate::events::{StateChangeAudit, SubscriptionEvent};
use crate::models::{
    ChangeStatus, Customer, Delegation, Invoice, Payment, Product, ProrationRecord,
    ScheduledChange, Subscription,
};
use crate::settlement::{SettlementFailure, SettlementReceipt};

/// Read side of the CRUD layer that owns products, delegations and customers.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn product(&self, id: Uuid) -> anyhow::Result<Option<Product>>;
    async fn delegation(&self, id: Uuid) -> anyhow::Result<Option<Delegation>>;
    async fn customer(&self, id: Uuid) -> anyhow::Result<Option<Customer>>;
    /// Records that a wallet was charged; idempotent for a given timestamp.
    async fn touch_wallet(
        &self,
        wallet_address: &str,
        network_id: &str,
        used_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Returns `false` when a row with the same id already exists.
    async fn insert_subscription(&self, subscription: &Subscription) -> anyhow::Result<bool>;
    async fn subscription(&self, id: Uuid) -> anyhow::Result<Option<Subscription>>;
    async fn update_subscription(&self, subscription: &Subscription) -> anyhow::Result<()>;
    async fn delete_subscription(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Subscription>>;
    /// Leases the redemption due at `due_at` until `until`. Returns `false` when the row is no
    /// longer active at that due date or another sweep holds an unexpired lease.
    async fn claim_redemption(
        &self,
        id: Uuid,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
    async fn release_redemption(&self, id: Uuid) -> anyhow::Result<()>;
    async fn list_workspace_subscriptions(
        &self,
        workspace_id: Uuid,
    ) -> anyhow::Result<Vec<Subscription>>;
}

#[async_trait]
pub trait ScheduledChangeStore: Send + Sync {
    async fn insert_change(&self, change: &ScheduledChange) -> anyhow::Result<()>;
    async fn change(&self, id: Uuid) -> anyhow::Result<Option<ScheduledChange>>;
    async fn list_due_changes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledChange>>;
    async fn changes_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Vec<ScheduledChange>>;
    /// Moves a change from `from` to `to` only if it is still in `from`.
    async fn transition_change(
        &self,
        id: Uuid,
        from: ChangeStatus,
        to: ChangeStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
    /// Removes a change only while it is still `scheduled`.
    async fn delete_scheduled_change(&self, id: Uuid) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append_event(&self, event: &SubscriptionEvent) -> anyhow::Result<()>;
    async fn events_for(&self, subscription_id: Uuid) -> anyhow::Result<Vec<SubscriptionEvent>>;
    /// Whether a redeemed event for this subscription already carries `transaction_ref`.
    async fn has_settlement_event(
        &self,
        subscription_id: Uuid,
        transaction_ref: &str,
    ) -> anyhow::Result<bool>;
    async fn append_audit(&self, audit: &StateChangeAudit) -> anyhow::Result<()>;
    async fn audits_for(&self, subscription_id: Uuid) -> anyhow::Result<Vec<StateChangeAudit>>;

    async fn insert_proration(&self, record: &ProrationRecord) -> anyhow::Result<()>;
    async fn prorations_for(&self, subscription_id: Uuid)
    -> anyhow::Result<Vec<ProrationRecord>>;

    /// Returns `false` when a payment for the same transaction already exists.
    async fn insert_payment(&self, payment: &Payment) -> anyhow::Result<bool>;
    async fn payment_by_transaction(&self, transaction_ref: &str)
    -> anyhow::Result<Option<Payment>>;
    async fn uninvoiced_payments(&self, limit: usize) -> anyhow::Result<Vec<Payment>>;
    /// Returns `false` when the payment is already invoiced or a period invoice covers the same
    /// subscription period.
    async fn insert_invoice(&self, invoice: &Invoice) -> anyhow::Result<bool>;
    async fn invoice_for_payment(&self, payment_id: Uuid) -> anyhow::Result<Option<Invoice>>;
    async fn link_invoice(&self, payment_id: Uuid, invoice_id: Uuid) -> anyhow::Result<()>;

    async fn receipt(&self, idempotency_key: &str) -> anyhow::Result<Option<SettlementReceipt>>;
    async fn save_receipt(&self, receipt: &SettlementReceipt) -> anyhow::Result<()>;
    async fn incomplete_receipts(&self, limit: usize) -> anyhow::Result<Vec<SettlementReceipt>>;
    async fn record_failure(&self, failure: &SettlementFailure) -> anyhow::Result<()>;
    async fn failure(&self, id: Uuid) -> anyhow::Result<Option<SettlementFailure>>;
    async fn failures_for_key(&self, idempotency_key: &str)
    -> anyhow::Result<Vec<SettlementFailure>>;
}

#[async_trait]
pub trait DunningStore: Send + Sync {
    async fn dunning_configuration(
        &self,
        workspace_id: Uuid,
    ) -> anyhow::Result<Option<DunningConfiguration>>;
    async fn put_dunning_configuration(&self, config: &DunningConfiguration)
    -> anyhow::Result<()>;

    async fn insert_campaign(&self, campaign: &DunningCampaign) -> anyhow::Result<()>;
    async fn campaign(&self, id: Uuid) -> anyhow::Result<Option<DunningCampaign>>;
    async fn active_campaign_for(
        &self,
        target: &CampaignTarget,
    ) -> anyhow::Result<Option<DunningCampaign>>;
    async fn list_due_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<DunningCampaign>>;
    /// Writes `campaign` only if the stored row is still active at `expected_attempt`.
    async fn update_campaign_if(
        &self,
        expected_attempt: u32,
        campaign: &DunningCampaign,
    ) -> anyhow::Result<bool>;

    async fn append_attempt(&self, attempt: &DunningAttempt) -> anyhow::Result<()>;
    async fn attempts_for(&self, campaign_id: Uuid) -> anyhow::Result<Vec<DunningAttempt>>;
}

/// The full record store the engine runs against.
pub trait RecordStore:
    CatalogStore + SubscriptionStore + ScheduledChangeStore + LedgerStore + DunningStore
{
}

impl<T> RecordStore for T where
    T: CatalogStore + SubscriptionStore + ScheduledChangeStore + LedgerStore + DunningStore
{
}
