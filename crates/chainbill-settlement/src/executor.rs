use std::sync::Arc;
use std::time::Duration;

use chainbill_core::{
    BookkeepingStep, CatalogStore, ChargeQuote, EngineSettings, Invoice, LedgerStore, Payment,
    RecordStore, SettlementContext, SettlementFailure, SettlementPurpose, SettlementReceipt,
    Subscription, SubscriptionEvent, SubscriptionEventKind, SubscriptionStatus, SubscriptionStore,
};
use chainbill_lifecycle::{SubscriptionLifecycle, apply_redemption, initial_subscription};
use chainbill_tools::{
    ChargeContext, DelegationProof, DiscountCalculator, ExecutionPayload, ExecutionService,
    NoDiscount, NoTax, TaxCalculator, TaxResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::{idempotency_key, validate_context};
use crate::error::{FailedSettlement, SettlementError};

#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub transaction_ref: String,
    pub idempotency_key: String,
    pub subscription: Option<Subscription>,
    pub payment: Payment,
    /// `None` when invoicing failed; reconciliation issues it later.
    pub invoice: Option<Invoice>,
    /// The transfer was confirmed by an earlier call; only bookkeeping ran this time.
    pub resumed: bool,
}

/// Submits delegated transfers and reconciles the ledger with their outcome exactly once.
pub struct SettlementExecutor {
    pub(crate) store: Arc<dyn RecordStore>,
    execution: Arc<dyn ExecutionService>,
    tax: Arc<dyn TaxCalculator>,
    discount: Arc<dyn DiscountCalculator>,
    lifecycle: SubscriptionLifecycle,
    timeout: Duration,
    pub(crate) batch_size: usize,
}

impl SettlementExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        execution: Arc<dyn ExecutionService>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            lifecycle: SubscriptionLifecycle::new(store.clone()),
            store,
            execution,
            tax: Arc::new(NoTax),
            discount: Arc::new(NoDiscount),
            timeout: settings.execution_timeout,
            batch_size: settings.batch_size,
        }
    }

    pub fn with_calculators(
        mut self,
        tax: Arc<dyn TaxCalculator>,
        discount: Arc<dyn DiscountCalculator>,
    ) -> Self {
        self.tax = tax;
        self.discount = discount;
        self
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    /// Settles one logical redemption. Every failure is recorded before it is returned.
    pub async fn settle(
        &self,
        context: SettlementContext,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, FailedSettlement> {
        let key = idempotency_key(&context);
        match self.try_settle(&key, &context, now).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => Err(self.record_failure(key, context, error, now).await),
        }
    }

    async fn try_settle(
        &self,
        key: &str,
        context: &SettlementContext,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let existing = self.existing_receipt(key).await.map_err(|err| {
            SettlementError::ServiceUnavailable(format!("receipt lookup failed: {err:#}"))
        })?;

        let (receipt, resumed) = match existing {
            Some(receipt) => {
                info!(
                    "settlement {key} already submitted as {}, resuming bookkeeping",
                    receipt.transaction_ref
                );
                (receipt, true)
            }
            None => {
                validate_context(context, now).map_err(SettlementError::Validation)?;
                let quote = self.quote(context).await;
                if quote.total <= Decimal::ZERO {
                    return Err(SettlementError::Validation(format!(
                        "nothing to charge after discount, total {}",
                        quote.total
                    )));
                }

                let transaction_ref = self.submit(key, context, &quote).await?;
                let receipt = SettlementReceipt {
                    idempotency_key: key.to_string(),
                    transaction_ref,
                    context: context.clone(),
                    quote,
                    completed_steps: Vec::new(),
                    completed: false,
                    submitted_at: now,
                    updated_at: now,
                };
                self.store
                    .save_receipt(&receipt)
                    .await
                    .map_err(|err| bookkeeping_error(&receipt, err))?;
                info!(
                    "settlement {key} confirmed as {} for {} {}",
                    receipt.transaction_ref, receipt.quote.total, receipt.context.currency
                );
                (receipt, false)
            }
        };

        let transaction_ref = receipt.transaction_ref.clone();
        let (subscription, payment) = self.complete_bookkeeping(receipt, now).await?;

        let invoice = match self.issue_invoice(&payment, now).await {
            Ok(invoice) => Some(invoice),
            Err(err) => {
                warn!("failed to invoice payment {}: {err:#}", payment.id);
                None
            }
        };

        Ok(SettlementOutcome {
            transaction_ref,
            idempotency_key: key.to_string(),
            subscription,
            payment,
            invoice,
            resumed,
        })
    }

    /// The stored receipt for `key`, or one rebuilt from a failure recorded after the transfer
    /// was confirmed but before its receipt could be written.
    async fn existing_receipt(&self, key: &str) -> anyhow::Result<Option<SettlementReceipt>> {
        if let Some(receipt) = self.store.receipt(key).await? {
            return Ok(Some(receipt));
        }

        let failures = self.store.failures_for_key(key).await?;
        let Some(receipt) = failures.iter().find_map(SettlementFailure::confirmed_receipt) else {
            return Ok(None);
        };
        warn!(
            "settlement {key} has no receipt but transaction {} was confirmed, restoring it",
            receipt.transaction_ref
        );
        self.store.save_receipt(&receipt).await?;
        Ok(Some(receipt))
    }

    async fn quote(&self, context: &SettlementContext) -> ChargeQuote {
        let charge = ChargeContext {
            workspace_id: context.workspace_id,
            customer_id: context.customer_id,
            product_id: context.product.id,
            currency: context.currency.clone(),
        };

        let discount = match self.discount.compute(context.amount, &charge).await {
            Ok(discount) => discount.max(Decimal::ZERO).min(context.amount),
            Err(err) => {
                warn!("discount calculation failed, charging without discount: {err:#}");
                Decimal::ZERO
            }
        };
        let taxable = context.amount - discount;
        let tax = match self.tax.compute(taxable, &charge).await {
            Ok(tax) => tax,
            Err(err) => {
                warn!("tax calculation failed, charging without tax: {err:#}");
                TaxResult::zero()
            }
        };

        ChargeQuote {
            subtotal: context.amount,
            discount,
            tax: tax.tax_amount,
            total: taxable + tax.tax_amount,
            tax_breakdown: tax.breakdown,
        }
    }

    async fn submit(
        &self,
        key: &str,
        context: &SettlementContext,
        quote: &ChargeQuote,
    ) -> Result<String, SettlementError> {
        let proof = DelegationProof::from(&context.delegation);
        let payload = ExecutionPayload {
            idempotency_key: key.to_string(),
            network_id: context.delegation.network_id.clone(),
            token_address: context.delegation.token_address.clone(),
            from_wallet: context.delegation.wallet_address.clone(),
            amount: quote.total,
            currency: context.currency.clone(),
            memo: format!(
                "{} #{} {}",
                context.purpose.as_str(),
                context.sequence,
                context.product.name
            ),
        };

        match tokio::time::timeout(self.timeout, self.execution.submit(&proof, &payload)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SettlementError::ServiceUnavailable(format!(
                "no response within {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Runs every bookkeeping step the receipt has not recorded yet, in order.
    pub(crate) async fn complete_bookkeeping(
        &self,
        mut receipt: SettlementReceipt,
        now: DateTime<Utc>,
    ) -> Result<(Option<Subscription>, Payment), SettlementError> {
        for step in steps_for(receipt.context.purpose) {
            if receipt.has_completed(step) {
                continue;
            }

            let result = match step {
                BookkeepingStep::SubscriptionCreated => self.create_subscription(&receipt).await,
                BookkeepingStep::EventRecorded => self.record_redeemed_event(&receipt).await,
                BookkeepingStep::PaymentRecorded => self.record_payment(&receipt).await,
                BookkeepingStep::RedemptionApplied => self.advance_subscription(&receipt, now).await,
                BookkeepingStep::WalletTouched => self.touch_wallet(&receipt, now).await,
            };
            result.map_err(|err| bookkeeping_error(&receipt, err))?;

            receipt.completed_steps.push(step);
            receipt.updated_at = now;
            self.store
                .save_receipt(&receipt)
                .await
                .map_err(|err| bookkeeping_error(&receipt, err))?;
        }

        if !receipt.completed {
            receipt.completed = true;
            receipt.updated_at = now;
            self.store
                .save_receipt(&receipt)
                .await
                .map_err(|err| bookkeeping_error(&receipt, err))?;
        }

        let payment = self
            .store
            .payment_by_transaction(&receipt.transaction_ref)
            .await
            .map_err(|err| bookkeeping_error(&receipt, err))?
            .ok_or_else(|| {
                bookkeeping_error(
                    &receipt,
                    anyhow::anyhow!("payment for {} is missing", receipt.transaction_ref),
                )
            })?;

        let subscription = match receipt.context.subscription_id {
            Some(id) => self
                .store
                .subscription(id)
                .await
                .map_err(|err| bookkeeping_error(&receipt, err))?,
            None => None,
        };

        Ok((subscription, payment))
    }

    async fn create_subscription(&self, receipt: &SettlementReceipt) -> anyhow::Result<()> {
        let context = &receipt.context;
        let Some(subscription_id) = context.subscription_id else {
            anyhow::bail!("initial settlement {} has no subscription id", receipt.idempotency_key);
        };
        let started_at = context.period_start.unwrap_or(receipt.submitted_at);

        let subscription = initial_subscription(
            subscription_id,
            context.workspace_id,
            context.customer_id,
            &context.product,
            context.line_items.clone(),
            context.currency.clone(),
            context.delegation.id,
            started_at,
        )?;
        self.store.insert_subscription(&subscription).await?;

        let already_announced = self
            .store
            .events_for(subscription_id)
            .await?
            .iter()
            .any(|event| event.kind == SubscriptionEventKind::Created);
        if !already_announced {
            let event =
                SubscriptionEvent::new(subscription_id, SubscriptionEventKind::Created, started_at)
                    .with_settlement(&receipt.transaction_ref, receipt.quote.total)
                    .with_payload(json!({ "product_id": context.product.id }));
            self.store.append_event(&event).await?;
        }
        Ok(())
    }

    async fn record_redeemed_event(&self, receipt: &SettlementReceipt) -> anyhow::Result<()> {
        let Some(subscription_id) = receipt.context.subscription_id else {
            return Ok(());
        };
        if self
            .store
            .has_settlement_event(subscription_id, &receipt.transaction_ref)
            .await?
        {
            return Ok(());
        }

        let event = SubscriptionEvent::new(
            subscription_id,
            SubscriptionEventKind::Redeemed,
            receipt.submitted_at,
        )
        .with_settlement(&receipt.transaction_ref, receipt.quote.total)
        .with_payload(json!({
            "purpose": receipt.context.purpose.as_str(),
            "sequence": receipt.context.sequence,
            "idempotency_key": receipt.idempotency_key,
        }));
        self.store.append_event(&event).await
    }

    async fn record_payment(&self, receipt: &SettlementReceipt) -> anyhow::Result<()> {
        let context = &receipt.context;
        let payment = Payment {
            id: Uuid::new_v4(),
            transaction_ref: receipt.transaction_ref.clone(),
            workspace_id: context.workspace_id,
            customer_id: context.customer_id,
            subscription_id: context.subscription_id,
            amount: receipt.quote.total,
            subtotal: receipt.quote.subtotal,
            discount: receipt.quote.discount,
            tax: receipt.quote.tax,
            tax_breakdown: receipt.quote.tax_breakdown.clone(),
            currency: context.currency.clone(),
            purpose: context.purpose,
            period_start: context.period_start,
            period_end: context.period_end,
            invoice_id: None,
            settled_at: receipt.submitted_at,
        };
        self.store.insert_payment(&payment).await?;
        Ok(())
    }

    async fn advance_subscription(
        &self,
        receipt: &SettlementReceipt,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let context = &receipt.context;
        let Some(subscription_id) = context.subscription_id else {
            return Ok(());
        };
        let Some(mut subscription) = self.store.subscription(subscription_id).await? else {
            anyhow::bail!("subscription {subscription_id} does not exist");
        };

        let previous_amount = subscription.amount;
        let effect = apply_redemption(
            &mut subscription,
            &context.product,
            context.purpose,
            receipt.quote.total,
            &receipt.transaction_ref,
            context.period_start,
            now,
        )?;
        if !effect.applied {
            return Ok(());
        }
        self.store.update_subscription(&subscription).await?;

        if subscription.status == SubscriptionStatus::Completed
            && effect.previous_status != SubscriptionStatus::Completed
        {
            let event = SubscriptionEvent::new(subscription_id, SubscriptionEventKind::Completed, now)
                .with_settlement(&receipt.transaction_ref, receipt.quote.total)
                .with_payload(json!({ "redemption_count": subscription.redemption_count }));
            self.lifecycle
                .record_transition(
                    &subscription,
                    effect.previous_status,
                    previous_amount,
                    event,
                    "term reached",
                )
                .await?;
            info!("subscription {subscription_id} completed its term");
        }
        Ok(())
    }

    async fn touch_wallet(
        &self,
        receipt: &SettlementReceipt,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let delegation = &receipt.context.delegation;
        self.store
            .touch_wallet(&delegation.wallet_address, &delegation.network_id, now)
            .await
    }

    pub(crate) async fn record_failure(
        &self,
        key: String,
        context: SettlementContext,
        error: SettlementError,
        now: DateTime<Utc>,
    ) -> FailedSettlement {
        let completed_steps = match &error {
            SettlementError::Bookkeeping {
                transaction_ref,
                completed_steps,
                message,
                ..
            } => {
                error!(
                    "bookkeeping failed for settlement {key} after transaction {transaction_ref}, completed steps {completed_steps:?}: {message}"
                );
                completed_steps.clone()
            }
            other => {
                warn!("settlement {key} failed: {other}");
                Vec::new()
            }
        };

        let failure = SettlementFailure {
            id: Uuid::new_v4(),
            idempotency_key: key,
            kind: error.kind(),
            message: error.to_string(),
            wallet_address: context.delegation.wallet_address.clone(),
            transaction_ref: error.transaction_ref().map(str::to_string),
            completed_steps,
            quote: error.settled_quote().cloned(),
            context,
            occurred_at: now,
        };
        if let Err(err) = self.store.record_failure(&failure).await {
            error!("failed to record settlement failure {}: {err:#}", failure.id);
        }

        FailedSettlement { error, failure }
    }
}

fn steps_for(purpose: SettlementPurpose) -> Vec<BookkeepingStep> {
    match purpose {
        SettlementPurpose::Initial => vec![
            BookkeepingStep::SubscriptionCreated,
            BookkeepingStep::EventRecorded,
            BookkeepingStep::PaymentRecorded,
            BookkeepingStep::RedemptionApplied,
            BookkeepingStep::WalletTouched,
        ],
        SettlementPurpose::Renewal | SettlementPurpose::Proration => vec![
            BookkeepingStep::EventRecorded,
            BookkeepingStep::PaymentRecorded,
            BookkeepingStep::RedemptionApplied,
            BookkeepingStep::WalletTouched,
        ],
        SettlementPurpose::OneTime => vec![
            BookkeepingStep::PaymentRecorded,
            BookkeepingStep::WalletTouched,
        ],
    }
}

fn bookkeeping_error(receipt: &SettlementReceipt, err: anyhow::Error) -> SettlementError {
    SettlementError::Bookkeeping {
        transaction_ref: receipt.transaction_ref.clone(),
        completed_steps: receipt.completed_steps.clone(),
        quote: receipt.quote.clone(),
        message: format!("{err:#}"),
    }
}
