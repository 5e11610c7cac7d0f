use std::sync::Arc;
use std::time::Duration as StdDuration;

use chainbill_core::{
    BillingInterval, BookkeepingStep, Customer, Delegation, EngineSettings, IntervalUnit,
    LedgerStore, LineItem, Product, SettlementErrorKind, SettlementPurpose, SubscriptionEventKind,
    SubscriptionStatus, SubscriptionStore,
};
use chainbill_eventstore::{FailPoint, InMemoryRecordStore};
use chainbill_mocks::{FailingCalculator, FixedDiscount, FlatRateTax, ScriptedExecutionService};
use chainbill_settlement::{SettlementExecutor, initial_context, one_time_context, renewal_context};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;
use rust_decimal::Decimal;
use uuid::Uuid;

struct Fixture {
    store: Arc<InMemoryRecordStore>,
    execution: ScriptedExecutionService,
    executor: SettlementExecutor,
    product: Product,
    delegation: Delegation,
}

fn day(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap() + Duration::days(offset)
}

fn items(amount: i64) -> Vec<LineItem> {
    vec![LineItem {
        price_id: Uuid::new_v4(),
        description: "plan".to_string(),
        quantity: 1,
        unit_amount: Decimal::from(amount),
    }]
}

async fn fixture(term_length: Option<u32>, settings: EngineSettings) -> Fixture {
    let store = Arc::new(InMemoryRecordStore::new());
    let customer = Customer {
        id: Uuid::new_v4(),
        email: "buyer@example.com".to_string(),
        in_app_handle: None,
    };
    let product = Product {
        id: Uuid::new_v4(),
        workspace_id: Uuid::new_v4(),
        name: "Growth".to_string(),
        recurring: true,
        interval: Some(BillingInterval {
            unit: IntervalUnit::Day,
            count: 30,
        }),
        term_length,
        currency: "USDC".to_string(),
    };
    let delegation = Delegation {
        id: Uuid::new_v4(),
        customer_id: customer.id,
        wallet_address: "0xcustomer".to_string(),
        token_address: "0xusdc".to_string(),
        network_id: "base".to_string(),
        proof: "signed-proof".to_string(),
        expires_at: None,
    };
    store.put_customer(customer).await;
    store.put_product(product.clone()).await;
    store.put_delegation(delegation.clone()).await;

    let execution = ScriptedExecutionService::new();
    let executor = SettlementExecutor::new(store.clone(), Arc::new(execution.clone()), &settings);

    Fixture {
        store,
        execution,
        executor,
        product,
        delegation,
    }
}

impl Fixture {
    async fn checkout(&self, amount: i64) -> chainbill_core::SettlementContext {
        initial_context(
            &*self.store,
            self.delegation.customer_id,
            self.product.id,
            self.delegation.id,
            items(amount),
            day(0),
        )
        .await
        .unwrap()
    }
}

#[rstest]
#[tokio::test]
async fn checkout_creates_subscription_payment_and_invoice() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = fx.checkout(100).await;

    let outcome = fx.executor.settle(context, day(0)).await.unwrap();

    let subscription = outcome.subscription.unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.redemption_count, 1);
    assert_eq!(subscription.next_redemption_at, Some(day(30)));
    assert_eq!(subscription.last_settlement_ref.as_deref(), Some(outcome.transaction_ref.as_str()));
    assert_eq!(outcome.payment.amount, Decimal::from(100));
    assert!(outcome.invoice.is_some());
    assert!(!outcome.resumed);

    let receipt = fx.store.receipt(&outcome.idempotency_key).await.unwrap().unwrap();
    assert!(receipt.completed);
    assert_eq!(receipt.completed_steps.len(), 5);
    assert_eq!(fx.store.wallet_last_used("0xcustomer", "base").await, Some(day(0)));

    let kinds: Vec<_> = fx
        .store
        .events_for(subscription.id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(kinds, vec![SubscriptionEventKind::Created, SubscriptionEventKind::Redeemed]);
}

#[rstest]
#[tokio::test]
async fn bookkeeping_failure_is_resumed_without_resubmitting() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = fx.checkout(100).await;
    fx.store.fail_next(FailPoint::InsertPayment).await;

    let failed = fx.executor.settle(context.clone(), day(0)).await.unwrap_err();

    assert_eq!(failed.kind(), SettlementErrorKind::Bookkeeping);
    assert!(!failed.error.is_retryable());
    assert_eq!(failed.failure.transaction_ref.as_deref(), Some("0xmock0001"));
    assert_eq!(
        failed.failure.completed_steps,
        vec![BookkeepingStep::SubscriptionCreated, BookkeepingStep::EventRecorded]
    );
    assert_eq!(
        fx.store
            .failures_for_key(&failed.failure.idempotency_key)
            .await
            .unwrap()
            .len(),
        1
    );

    let outcome = fx.executor.settle(context, day(0)).await.unwrap();

    assert!(outcome.resumed);
    assert_eq!(outcome.transaction_ref, "0xmock0001");
    assert_eq!(fx.execution.submission_count().await, 1);
    assert_eq!(fx.store.payments().await.len(), 1);
    let subscription = outcome.subscription.unwrap();
    assert_eq!(subscription.redemption_count, 1);
    assert_eq!(
        fx.store.events_for(subscription.id).await.unwrap().len(),
        2,
        "created and redeemed are written once"
    );
}

#[rstest]
#[tokio::test]
async fn lost_receipt_is_restored_from_the_failure_record() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = fx.checkout(100).await;
    fx.store.fail_next(FailPoint::SaveReceipt).await;

    let failed = fx.executor.settle(context.clone(), day(0)).await.unwrap_err();

    assert_eq!(failed.kind(), SettlementErrorKind::Bookkeeping);
    assert_eq!(failed.failure.transaction_ref.as_deref(), Some("0xmock0001"));
    assert_eq!(failed.failure.quote.as_ref().map(|quote| quote.total), Some(Decimal::from(100)));
    assert!(fx.store.receipt(&failed.failure.idempotency_key).await.unwrap().is_none());

    let outcome = fx.executor.settle(context, day(1)).await.unwrap();

    assert!(outcome.resumed);
    assert_eq!(outcome.transaction_ref, "0xmock0001");
    assert_eq!(fx.execution.submission_count().await, 1);
    assert_eq!(outcome.payment.amount, Decimal::from(100));
    assert_eq!(outcome.payment.settled_at, day(0));
    assert_eq!(fx.store.payments().await.len(), 1);
    let receipt = fx.store.receipt(&outcome.idempotency_key).await.unwrap().unwrap();
    assert!(receipt.completed);
}

#[rstest]
#[tokio::test]
async fn rejected_checkout_writes_nothing_but_the_failure() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = fx.checkout(100).await;
    let subscription_id = context.subscription_id.unwrap();
    fx.execution.reject_next("insufficient balance").await;

    let failed = fx.executor.settle(context, day(0)).await.unwrap_err();

    assert_eq!(failed.kind(), SettlementErrorKind::Rejected);
    assert_eq!(failed.failure.transaction_ref, None);
    assert!(fx.store.subscription(subscription_id).await.unwrap().is_none());
    assert!(fx.store.receipt(&failed.failure.idempotency_key).await.unwrap().is_none());
    assert!(fx.store.payments().await.is_empty());
}

#[rstest]
#[tokio::test]
async fn slow_execution_service_counts_as_unavailable() {
    let settings = EngineSettings {
        execution_timeout: StdDuration::from_millis(20),
        ..EngineSettings::default()
    };
    let fx = fixture(None, settings).await;
    fx.execution.set_delay(Some(StdDuration::from_millis(500))).await;
    let context = fx.checkout(100).await;

    let failed = fx.executor.settle(context, day(0)).await.unwrap_err();

    assert_eq!(failed.kind(), SettlementErrorKind::ServiceUnavailable);
    assert!(failed.error.is_retryable());
}

#[rstest]
#[tokio::test]
async fn invalid_context_is_never_submitted() {
    let fx = fixture(None, EngineSettings::default()).await;
    let mut context = fx.checkout(100).await;
    context.delegation.expires_at = Some(day(-1));

    let failed = fx.executor.settle(context, day(0)).await.unwrap_err();

    assert_eq!(failed.kind(), SettlementErrorKind::Validation);
    assert_eq!(fx.execution.submission_count().await, 0);
}

#[rstest]
#[tokio::test]
async fn renewals_stop_at_term_and_complete_the_subscription() {
    let fx = fixture(Some(2), EngineSettings::default()).await;
    let context = fx.checkout(100).await;
    let subscription = fx.executor.settle(context, day(0)).await.unwrap().subscription.unwrap();

    let renewal = renewal_context(&*fx.store, &subscription).await.unwrap();
    assert_eq!(renewal.sequence, 2);
    assert_eq!(renewal.period_start, Some(day(30)));
    let outcome = fx.executor.settle(renewal, day(30)).await.unwrap();

    let completed = outcome.subscription.unwrap();
    assert_eq!(completed.status, SubscriptionStatus::Completed);
    assert_eq!(completed.redemption_count, 2);
    assert_eq!(completed.next_redemption_at, None);
    assert_eq!(completed.total_charged, Decimal::from(200));
    assert!(renewal_context(&*fx.store, &completed).await.is_err());

    let audits = fx.store.audits_for(completed.id).await.unwrap();
    assert_eq!(audits.last().unwrap().to_status, SubscriptionStatus::Completed);
}

#[rstest]
#[tokio::test]
async fn reconcile_finishes_receipts_and_invoices() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = fx.checkout(100).await;
    fx.store.fail_next(FailPoint::TouchWallet).await;
    fx.executor.settle(context, day(0)).await.unwrap_err();

    let report = fx.executor.reconcile(day(1)).await.unwrap();

    assert_eq!(report.receipts_completed, 1);
    assert_eq!(report.invoices_issued, 1);
    assert_eq!(fx.store.invoices().await.len(), 1);
    assert!(fx.store.incomplete_receipts(10).await.unwrap().is_empty());
    assert_eq!(fx.execution.submission_count().await, 1);

    let again = fx.executor.reconcile(day(2)).await.unwrap();
    assert_eq!(again, Default::default());
}

#[rstest]
#[tokio::test]
async fn invoice_failure_does_not_fail_the_settlement() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = fx.checkout(100).await;
    fx.store.fail_next(FailPoint::InsertInvoice).await;

    let outcome = fx.executor.settle(context, day(0)).await.unwrap();

    assert!(outcome.invoice.is_none());
    let report = fx.executor.reconcile(day(0)).await.unwrap();
    assert_eq!(report.invoices_issued, 1);
    assert_eq!(
        fx.store.payments().await[0].invoice_id,
        Some(fx.store.invoices().await[0].id)
    );
}

#[rstest]
#[tokio::test]
async fn discount_and_tax_shape_the_submitted_amount() {
    let fx = fixture(None, EngineSettings::default()).await;
    let executor = SettlementExecutor::new(
        fx.store.clone(),
        Arc::new(fx.execution.clone()),
        &EngineSettings::default(),
    )
    .with_calculators(
        Arc::new(FlatRateTax {
            rate: Decimal::new(10, 2),
        }),
        Arc::new(FixedDiscount {
            amount: Decimal::from(5),
        }),
    );
    let context = fx.checkout(100).await;

    let outcome = executor.settle(context, day(0)).await.unwrap();

    assert_eq!(outcome.payment.amount, Decimal::new(1045, 1));
    assert_eq!(fx.execution.submissions().await[0].amount, Decimal::new(1045, 1));
    let invoice = outcome.invoice.unwrap();
    assert_eq!(invoice.subtotal, Decimal::from(100));
    assert_eq!(invoice.discount, Decimal::from(5));
    assert_eq!(invoice.tax, Decimal::new(95, 1));
    assert_eq!(invoice.total, Decimal::new(1045, 1));
}

#[rstest]
#[tokio::test]
async fn calculator_outage_charges_the_plain_amount() {
    let fx = fixture(None, EngineSettings::default()).await;
    let executor = SettlementExecutor::new(
        fx.store.clone(),
        Arc::new(fx.execution.clone()),
        &EngineSettings::default(),
    )
    .with_calculators(Arc::new(FailingCalculator), Arc::new(FailingCalculator));
    let context = fx.checkout(100).await;

    let outcome = executor.settle(context, day(0)).await.unwrap();

    assert_eq!(outcome.payment.amount, Decimal::from(100));
}

#[rstest]
#[tokio::test]
async fn one_time_purchase_records_payment_without_subscription() {
    let fx = fixture(None, EngineSettings::default()).await;
    let context = one_time_context(
        &*fx.store,
        Uuid::new_v4(),
        fx.delegation.customer_id,
        fx.product.id,
        fx.delegation.id,
        items(40),
    )
    .await
    .unwrap();

    let outcome = fx.executor.settle(context, day(3)).await.unwrap();

    assert!(outcome.subscription.is_none());
    assert_eq!(outcome.payment.purpose, SettlementPurpose::OneTime);
    assert_eq!(outcome.invoice.unwrap().subscription_id, None);
}
