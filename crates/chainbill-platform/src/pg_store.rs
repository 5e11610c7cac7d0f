use anyhow::{Context, Result};
use async_trait::async_trait;
use chainbill_core::{
    CampaignStatus, CampaignTarget, CatalogStore, ChangeStatus, Customer, Delegation,
    DunningAttempt, DunningCampaign, DunningConfiguration, DunningStore, Invoice, LedgerStore,
    Payment, Product, ProrationRecord, ScheduledChange, ScheduledChangeStore, SettlementFailure,
    SettlementReceipt, StateChangeAudit, Subscription, SubscriptionEvent, SubscriptionEventKind,
    SubscriptionStatus, SubscriptionStore,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use uuid::Uuid;

/// Postgres-backed record store. Conditional updates are single `UPDATE ... WHERE` statements,
/// so concurrent workers race on the row rather than on an in-process lock.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_body<T: DeserializeOwned>(&self, sql: &str, id: Uuid) -> Result<Option<T>> {
        let row = sqlx::query(sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| decode_body(&row)).transpose()
    }
}

fn decode_body<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let Json(body) = row
        .try_get::<Json<T>, _>("body")
        .context("failed to decode record body")?;
    Ok(body)
}

fn decode_rows<T: DeserializeOwned>(rows: &[PgRow]) -> Result<Vec<T>> {
    rows.iter().map(decode_body).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Partial-unique key for "one active campaign per target".
fn target_key(target: &CampaignTarget) -> String {
    match target {
        CampaignTarget::Subscription { subscription_id } => {
            format!("subscription:{subscription_id}")
        }
        CampaignTarget::OneTimePayment { failure_id } => format!("one_time:{failure_id}"),
    }
}

#[async_trait]
impl CatalogStore for PgRecordStore {
    async fn product(&self, id: Uuid) -> Result<Option<Product>> {
        self.fetch_body("SELECT body FROM products WHERE id = $1", id)
            .await
    }

    async fn delegation(&self, id: Uuid) -> Result<Option<Delegation>> {
        self.fetch_body("SELECT body FROM delegations WHERE id = $1", id)
            .await
    }

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>> {
        self.fetch_body("SELECT body FROM customers WHERE id = $1", id)
            .await
    }

    async fn touch_wallet(
        &self,
        wallet_address: &str,
        network_id: &str,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_usage (wallet_address, network_id, last_used_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (wallet_address, network_id)
            DO UPDATE SET last_used_at = GREATEST(wallet_usage.last_used_at, EXCLUDED.last_used_at)
            "#,
        )
        .bind(wallet_address)
        .bind(network_id)
        .bind(used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgRecordStore {
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (id, workspace_id, status, next_redemption_at, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.workspace_id)
        .bind(subscription.status.as_str())
        .bind(subscription.next_redemption_at)
        .bind(Json(subscription))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        self.fetch_body("SELECT body FROM subscriptions WHERE id = $1", id)
            .await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, next_redemption_at = $3, body = $4
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.status.as_str())
        .bind(subscription.next_redemption_at)
        .bind(Json(subscription))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("subscription {} does not exist", subscription.id);
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT body
            FROM subscriptions
            WHERE status = $1 AND next_redemption_at <= $2
            ORDER BY next_redemption_at
            LIMIT $3
            "#,
        )
        .bind(SubscriptionStatus::Active.as_str())
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn claim_redemption(
        &self,
        id: Uuid,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET redemption_leased_until = $4
            WHERE id = $1
              AND status = $5
              AND next_redemption_at = $2
              AND (redemption_leased_until IS NULL OR redemption_leased_until <= $3)
            "#,
        )
        .bind(id)
        .bind(due_at)
        .bind(now)
        .bind(until)
        .bind(SubscriptionStatus::Active.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_redemption(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET redemption_leased_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_workspace_subscriptions(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT body FROM subscriptions WHERE workspace_id = $1 ORDER BY body->>'created_at'",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }
}

#[async_trait]
impl ScheduledChangeStore for PgRecordStore {
    async fn insert_change(&self, change: &ScheduledChange) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_changes (id, subscription_id, status, effective_at, created_at, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(change.id)
        .bind(change.subscription_id)
        .bind(change.status.as_str())
        .bind(change.effective_at)
        .bind(change.created_at)
        .bind(Json(change))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn change(&self, id: Uuid) -> Result<Option<ScheduledChange>> {
        self.fetch_body("SELECT body FROM scheduled_changes WHERE id = $1", id)
            .await
    }

    async fn list_due_changes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledChange>> {
        let rows = sqlx::query(
            r#"
            SELECT body
            FROM scheduled_changes
            WHERE status = $1 AND effective_at <= $2
            ORDER BY effective_at, created_at
            LIMIT $3
            "#,
        )
        .bind(ChangeStatus::Scheduled.as_str())
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn changes_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<ScheduledChange>> {
        let rows = sqlx::query(
            "SELECT body FROM scheduled_changes WHERE subscription_id = $1 ORDER BY created_at",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn transition_change(
        &self,
        id: Uuid,
        from: ChangeStatus,
        to: ChangeStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let processed_at =
            matches!(to, ChangeStatus::Completed | ChangeStatus::Failed).then_some(at);
        let result = sqlx::query(
            r#"
            UPDATE scheduled_changes
            SET status = $3,
                body = body || jsonb_build_object(
                    'status', $3::text,
                    'error_message', $4::text,
                    'processed_at', COALESCE(to_jsonb($5::timestamptz), body->'processed_at')
                )
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error_message)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_scheduled_change(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_changes WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(ChangeStatus::Scheduled.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl LedgerStore for PgRecordStore {
    async fn append_event(&self, event: &SubscriptionEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_events (id, subscription_id, kind, transaction_ref, occurred_at, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.subscription_id)
        .bind(event.kind.as_str())
        .bind(event.transaction_ref.as_deref())
        .bind(event.occurred_at)
        .bind(Json(event))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionEvent>> {
        let rows = sqlx::query(
            "SELECT body FROM subscription_events WHERE subscription_id = $1 ORDER BY seq",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn has_settlement_event(
        &self,
        subscription_id: Uuid,
        transaction_ref: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subscription_events
                WHERE subscription_id = $1 AND kind = $2 AND transaction_ref = $3
            ) AS found
            "#,
        )
        .bind(subscription_id)
        .bind(SubscriptionEventKind::Redeemed.as_str())
        .bind(transaction_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("found")?)
    }

    async fn append_audit(&self, audit: &StateChangeAudit) -> Result<()> {
        sqlx::query(
            "INSERT INTO state_change_audits (id, subscription_id, body) VALUES ($1, $2, $3)",
        )
        .bind(audit.id)
        .bind(audit.subscription_id)
        .bind(Json(audit))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audits_for(&self, subscription_id: Uuid) -> Result<Vec<StateChangeAudit>> {
        let rows = sqlx::query(
            "SELECT body FROM state_change_audits WHERE subscription_id = $1 ORDER BY seq",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn insert_proration(&self, record: &ProrationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO proration_records (id, subscription_id, body) VALUES ($1, $2, $3)",
        )
        .bind(record.id)
        .bind(record.subscription_id)
        .bind(Json(record))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prorations_for(&self, subscription_id: Uuid) -> Result<Vec<ProrationRecord>> {
        let rows = sqlx::query(
            "SELECT body FROM proration_records WHERE subscription_id = $1 ORDER BY seq",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (id, transaction_ref, invoice_id, settled_at, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (transaction_ref) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(&payment.transaction_ref)
        .bind(payment.invoice_id)
        .bind(payment.settled_at)
        .bind(Json(payment))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn payment_by_transaction(&self, transaction_ref: &str) -> Result<Option<Payment>> {
        let row = sqlx::query("SELECT body FROM payments WHERE transaction_ref = $1")
            .bind(transaction_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn uninvoiced_payments(&self, limit: usize) -> Result<Vec<Payment>> {
        let rows = sqlx::query(
            "SELECT body FROM payments WHERE invoice_id IS NULL ORDER BY settled_at, seq LIMIT $1",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO invoices (id, number, payment_id, subscription_id, purpose, period_start, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.number)
        .bind(invoice.payment_id)
        .bind(invoice.subscription_id)
        .bind(invoice.purpose.as_str())
        .bind(invoice.period_start)
        .bind(Json(invoice))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn invoice_for_payment(&self, payment_id: Uuid) -> Result<Option<Invoice>> {
        let row = sqlx::query("SELECT body FROM invoices WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn link_invoice(&self, payment_id: Uuid, invoice_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET invoice_id = $2, body = jsonb_set(body, '{invoice_id}', to_jsonb($2::uuid))
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receipt(&self, idempotency_key: &str) -> Result<Option<SettlementReceipt>> {
        let row = sqlx::query("SELECT body FROM settlement_receipts WHERE idempotency_key = $1")
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn save_receipt(&self, receipt: &SettlementReceipt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_receipts (idempotency_key, completed, submitted_at, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key)
            DO UPDATE SET completed = EXCLUDED.completed, body = EXCLUDED.body
            "#,
        )
        .bind(&receipt.idempotency_key)
        .bind(receipt.completed)
        .bind(receipt.submitted_at)
        .bind(Json(receipt))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn incomplete_receipts(&self, limit: usize) -> Result<Vec<SettlementReceipt>> {
        let rows = sqlx::query(
            "SELECT body FROM settlement_receipts WHERE NOT completed ORDER BY submitted_at LIMIT $1",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn record_failure(&self, failure: &SettlementFailure) -> Result<()> {
        sqlx::query(
            "INSERT INTO settlement_failures (id, idempotency_key, body) VALUES ($1, $2, $3)",
        )
        .bind(failure.id)
        .bind(&failure.idempotency_key)
        .bind(Json(failure))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failure(&self, id: Uuid) -> Result<Option<SettlementFailure>> {
        self.fetch_body("SELECT body FROM settlement_failures WHERE id = $1", id)
            .await
    }

    async fn failures_for_key(&self, idempotency_key: &str) -> Result<Vec<SettlementFailure>> {
        let rows = sqlx::query(
            "SELECT body FROM settlement_failures WHERE idempotency_key = $1 ORDER BY seq",
        )
        .bind(idempotency_key)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }
}

#[async_trait]
impl DunningStore for PgRecordStore {
    async fn dunning_configuration(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<DunningConfiguration>> {
        self.fetch_body(
            "SELECT body FROM dunning_configurations WHERE workspace_id = $1",
            workspace_id,
        )
        .await
    }

    async fn put_dunning_configuration(&self, config: &DunningConfiguration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dunning_configurations (workspace_id, body)
            VALUES ($1, $2)
            ON CONFLICT (workspace_id) DO UPDATE SET body = EXCLUDED.body
            "#,
        )
        .bind(config.workspace_id)
        .bind(Json(config))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_campaign(&self, campaign: &DunningCampaign) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dunning_campaigns (id, target_key, status, current_attempt, next_retry_at, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(campaign.id)
        .bind(target_key(&campaign.target))
        .bind(campaign.status.as_str())
        .bind(i64::from(campaign.current_attempt))
        .bind(campaign.next_retry_at)
        .bind(Json(campaign))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert dunning campaign {}", campaign.id))?;
        Ok(())
    }

    async fn campaign(&self, id: Uuid) -> Result<Option<DunningCampaign>> {
        self.fetch_body("SELECT body FROM dunning_campaigns WHERE id = $1", id)
            .await
    }

    async fn active_campaign_for(
        &self,
        target: &CampaignTarget,
    ) -> Result<Option<DunningCampaign>> {
        let row = sqlx::query(
            "SELECT body FROM dunning_campaigns WHERE target_key = $1 AND status = $2",
        )
        .bind(target_key(target))
        .bind(CampaignStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn list_due_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DunningCampaign>> {
        let rows = sqlx::query(
            r#"
            SELECT body
            FROM dunning_campaigns
            WHERE status = $1 AND next_retry_at <= $2
            ORDER BY next_retry_at
            LIMIT $3
            "#,
        )
        .bind(CampaignStatus::Active.as_str())
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }

    async fn update_campaign_if(
        &self,
        expected_attempt: u32,
        campaign: &DunningCampaign,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dunning_campaigns
            SET status = $3, current_attempt = $4, next_retry_at = $5, body = $6
            WHERE id = $1 AND status = 'active' AND current_attempt = $2
            "#,
        )
        .bind(campaign.id)
        .bind(i64::from(expected_attempt))
        .bind(campaign.status.as_str())
        .bind(i64::from(campaign.current_attempt))
        .bind(campaign.next_retry_at)
        .bind(Json(campaign))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_attempt(&self, attempt: &DunningAttempt) -> Result<()> {
        sqlx::query("INSERT INTO dunning_attempts (id, campaign_id, body) VALUES ($1, $2, $3)")
            .bind(attempt.id)
            .bind(attempt.campaign_id)
            .bind(Json(attempt))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn attempts_for(&self, campaign_id: Uuid) -> Result<Vec<DunningAttempt>> {
        let rows = sqlx::query(
            "SELECT body FROM dunning_attempts WHERE campaign_id = $1 ORDER BY seq",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        decode_rows(&rows)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn campaign_targets_have_distinct_keys() {
        let id = Uuid::new_v4();
        let subscription = target_key(&CampaignTarget::Subscription { subscription_id: id });
        let one_time = target_key(&CampaignTarget::OneTimePayment { failure_id: id });

        assert_eq!(subscription, format!("subscription:{id}"));
        assert_ne!(subscription, one_time);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(250, 250)]
    #[case(usize::MAX, i64::MAX)]
    fn limits_fit_bigint(#[case] limit: usize, #[case] expected: i64) {
        assert_eq!(sql_limit(limit), expected);
    }
}
