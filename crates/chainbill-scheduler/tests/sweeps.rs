use std::sync::Arc;

use async_trait::async_trait;
use chainbill_core::{
    BillingInterval, ChangeStatus, ChangeType, Delegation, EngineSettings, IntervalUnit,
    LedgerStore, LineItem, Product, ScheduledChange, ScheduledChangeStore, SettlementFailure,
    SettlementPurpose, Subscription, SubscriptionEventKind, SubscriptionStatus, SubscriptionStore,
};
use chainbill_eventstore::InMemoryRecordStore;
use chainbill_lifecycle::SubscriptionLifecycle;
use chainbill_mocks::ScriptedExecutionService;
use chainbill_scheduler::{RedemptionSweep, ScheduledChangeProcessor, charge_proration};
use chainbill_settlement::{SettlementExecutor, SettlementFailureHandler, initial_context};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct CollectingHandler {
    failures: RwLock<Vec<SettlementFailure>>,
}

#[async_trait]
impl SettlementFailureHandler for CollectingHandler {
    async fn handle_failure(
        &self,
        failure: &SettlementFailure,
        _now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.failures.write().await.push(failure.clone());
        Ok(())
    }
}

struct Fixture {
    store: Arc<InMemoryRecordStore>,
    execution: ScriptedExecutionService,
    executor: Arc<SettlementExecutor>,
    lifecycle: SubscriptionLifecycle,
    handler: Arc<CollectingHandler>,
    delegation: Delegation,
    subscription: Subscription,
}

fn day(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap() + Duration::days(offset)
}

fn items(amount: i64) -> Vec<LineItem> {
    vec![LineItem {
        price_id: Uuid::new_v4(),
        description: "plan".to_string(),
        quantity: 1,
        unit_amount: Decimal::from(amount),
    }]
}

async fn fixture() -> Fixture {
    let store = Arc::new(InMemoryRecordStore::new());
    let product = Product {
        id: Uuid::new_v4(),
        workspace_id: Uuid::new_v4(),
        name: "Scale".to_string(),
        recurring: true,
        interval: Some(BillingInterval {
            unit: IntervalUnit::Day,
            count: 30,
        }),
        term_length: None,
        currency: "USDC".to_string(),
    };
    let delegation = Delegation {
        id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        wallet_address: "0xpayer".to_string(),
        token_address: "0xusdc".to_string(),
        network_id: "base".to_string(),
        proof: "proof".to_string(),
        expires_at: None,
    };
    store.put_product(product.clone()).await;
    store.put_delegation(delegation.clone()).await;

    let execution = ScriptedExecutionService::new();
    let executor = Arc::new(SettlementExecutor::new(
        store.clone(),
        Arc::new(execution.clone()),
        &EngineSettings::default(),
    ));
    let context = initial_context(
        &*store,
        delegation.customer_id,
        product.id,
        delegation.id,
        items(300),
        day(0),
    )
    .await
    .unwrap();
    let subscription = executor
        .settle(context, day(0))
        .await
        .unwrap()
        .subscription
        .unwrap();

    Fixture {
        lifecycle: SubscriptionLifecycle::new(store.clone()),
        store,
        execution,
        executor,
        handler: Arc::new(CollectingHandler::default()),
        delegation,
        subscription,
    }
}

impl Fixture {
    fn processor(&self) -> ScheduledChangeProcessor {
        ScheduledChangeProcessor::new(self.executor.clone(), 50)
            .with_failure_handler(self.handler.clone())
    }

    fn redemptions(&self) -> RedemptionSweep {
        RedemptionSweep::new(self.executor.clone(), 50).with_failure_handler(self.handler.clone())
    }

    async fn reload(&self) -> Subscription {
        self.store
            .subscription(self.subscription.id)
            .await
            .unwrap()
            .unwrap()
    }
}

#[rstest]
#[tokio::test]
async fn second_change_sweep_is_a_no_op() {
    let fx = fixture().await;
    let change = fx
        .lifecycle
        .schedule_downgrade(fx.subscription.id, items(120), day(5))
        .await
        .unwrap();

    let early = fx.processor().run_sweep(day(29)).await.unwrap();
    assert_eq!(early.claimed, 0);

    let first = fx.processor().run_sweep(day(30)).await.unwrap();
    let second = fx.processor().run_sweep(day(30)).await.unwrap();

    assert_eq!(first.claimed, 1);
    assert_eq!(first.completed, 1);
    assert_eq!(second, Default::default());
    assert_eq!(fx.reload().await.amount, Decimal::from(120));
    let stored = fx.store.change(change.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ChangeStatus::Completed);
    assert_eq!(stored.processed_at, Some(day(30)));
}

#[rstest]
#[tokio::test]
async fn scheduled_cancellation_ends_the_subscription() {
    let fx = fixture().await;
    fx.lifecycle
        .schedule_cancellation(fx.subscription.id, day(10))
        .await
        .unwrap();

    let report = fx.processor().run_sweep(day(30)).await.unwrap();

    assert_eq!(report.completed, 1);
    let cancelled = fx.reload().await;
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.next_redemption_at, None);
}

#[rstest]
#[tokio::test]
async fn scheduled_resume_reactivates_and_settles() {
    let fx = fixture().await;
    fx.lifecycle
        .pause(fx.subscription.id, Some(day(20)), day(10))
        .await
        .unwrap();

    let report = fx.processor().run_sweep(day(20)).await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.settlement_failures, 0);
    let resumed = fx.reload().await;
    assert_eq!(resumed.status, SubscriptionStatus::Active);
    assert_eq!(resumed.redemption_count, 2);
    assert_eq!(resumed.current_period_start, day(20));
    assert_eq!(resumed.next_redemption_at, Some(day(50)));
    assert_eq!(fx.execution.submission_count().await, 2);
}

#[rstest]
#[tokio::test]
async fn immediate_change_types_found_in_the_queue_fail() {
    let fx = fixture().await;
    let stray = ScheduledChange::scheduled(
        fx.subscription.id,
        ChangeType::Upgrade,
        day(3),
        items(300),
        items(600),
        day(2),
    );
    fx.store.insert_change(&stray).await.unwrap();

    let report = fx.processor().run_sweep(day(3)).await.unwrap();

    assert_eq!(report.failed, 1);
    let stored = fx.store.change(stray.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ChangeStatus::Failed);
    assert!(stored.error_message.unwrap().contains("never swept"));
    assert_eq!(fx.reload().await.amount, Decimal::from(300));
}

#[rstest]
#[tokio::test]
async fn due_subscription_renews() {
    let fx = fixture().await;

    let report = fx.redemptions().run_sweep(day(30)).await.unwrap();

    assert_eq!(report.due, 1);
    assert_eq!(report.settled, 1);
    let renewed = fx.reload().await;
    assert_eq!(renewed.redemption_count, 2);
    assert_eq!(renewed.next_redemption_at, Some(day(60)));

    let again = fx.redemptions().run_sweep(day(30)).await.unwrap();
    assert_eq!(again.due, 0);
}

#[rstest]
#[tokio::test]
async fn rejected_renewal_goes_overdue_and_starts_recovery() {
    let fx = fixture().await;
    fx.execution.reject_next("insufficient balance").await;

    let report = fx.redemptions().run_sweep(day(30)).await.unwrap();

    assert_eq!(report.overdue, 1);
    let overdue = fx.reload().await;
    assert_eq!(overdue.status, SubscriptionStatus::Overdue);
    assert_eq!(overdue.next_redemption_at, Some(day(30)));
    let failures = fx.handler.failures.read().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].context.subscription_id, Some(fx.subscription.id));
}

#[rstest]
#[tokio::test]
async fn unavailable_execution_service_defers_the_renewal() {
    let fx = fixture().await;
    fx.execution.fail_next("503").await;

    let report = fx.redemptions().run_sweep(day(30)).await.unwrap();

    assert_eq!(report.deferred, 1);
    assert_eq!(fx.reload().await.status, SubscriptionStatus::Active);
    assert!(fx.handler.failures.read().await.is_empty());
}

#[rstest]
#[tokio::test]
async fn expired_delegation_expires_the_subscription() {
    let fx = fixture().await;
    let mut delegation = fx.delegation.clone();
    delegation.expires_at = Some(day(25));
    fx.store.put_delegation(delegation).await;

    let report = fx.redemptions().run_sweep(day(30)).await.unwrap();

    assert_eq!(report.expired, 1);
    assert_eq!(fx.reload().await.status, SubscriptionStatus::Expired);
    assert_eq!(fx.execution.submission_count().await, 1);
}

#[rstest]
#[tokio::test]
async fn pending_cancellation_skips_the_renewal() {
    let fx = fixture().await;
    fx.lifecycle
        .schedule_cancellation(fx.subscription.id, day(10))
        .await
        .unwrap();

    let report = fx.redemptions().run_sweep(day(30)).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(fx.execution.submission_count().await, 1);
}

#[rstest]
#[tokio::test]
async fn upgrade_proration_is_charged_without_advancing_the_period() {
    let fx = fixture().await;
    let upgrade = fx
        .lifecycle
        .upgrade(fx.subscription.id, items(600), day(10))
        .await
        .unwrap();

    let outcome = charge_proration(&fx.executor, &upgrade, day(10))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.payment.purpose, SettlementPurpose::Proration);
    assert_eq!(outcome.payment.amount, Decimal::from(200));
    let subscription = fx.reload().await;
    assert_eq!(subscription.redemption_count, 1);
    assert_eq!(subscription.next_redemption_at, Some(day(30)));
}

#[rstest]
#[tokio::test]
async fn overlapping_redemption_sweeps_settle_the_period_once() {
    let fx = fixture().await;
    fx.execution
        .set_delay(Some(std::time::Duration::from_millis(50)))
        .await;
    let (first, second) = (fx.redemptions(), fx.redemptions());

    let (first, second) = tokio::join!(first.run_sweep(day(30)), second.run_sweep(day(30)));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.settled + second.settled, 1);
    assert_eq!(first.contended + second.contended, 1);
    assert_eq!(fx.execution.submission_count().await, 2);
    let renewed = fx.reload().await;
    assert_eq!(renewed.redemption_count, 2);
    assert_eq!(renewed.total_charged, Decimal::from(600));
    assert_eq!(renewed.next_redemption_at, Some(day(60)));
}

#[rstest]
#[tokio::test]
async fn released_redemption_is_retried_by_the_next_sweep() {
    let fx = fixture().await;
    fx.execution.fail_next("503").await;

    let deferred = fx.redemptions().run_sweep(day(30)).await.unwrap();
    let retried = fx.redemptions().run_sweep(day(30)).await.unwrap();

    assert_eq!(deferred.deferred, 1);
    assert_eq!(retried.settled, 1);
    assert_eq!(retried.contended, 0);
    assert_eq!(fx.reload().await.redemption_count, 2);
}

#[rstest]
#[tokio::test]
async fn overlapping_change_sweeps_apply_the_change_once() {
    let fx = fixture().await;
    fx.lifecycle
        .pause(fx.subscription.id, Some(day(20)), day(10))
        .await
        .unwrap();
    fx.execution
        .set_delay(Some(std::time::Duration::from_millis(50)))
        .await;
    let (first, second) = (fx.processor(), fx.processor());

    let (first, second) = tokio::join!(first.run_sweep(day(20)), second.run_sweep(day(20)));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.claimed + second.claimed, 1);
    assert_eq!(first.completed + second.completed, 1);
    assert!(first.skipped + second.skipped <= 1);
    let resumes = fx
        .store
        .events_for(fx.subscription.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|event| event.kind == SubscriptionEventKind::Resumed)
        .count();
    assert_eq!(resumes, 1);
    assert_eq!(fx.execution.submission_count().await, 2);
    assert_eq!(fx.reload().await.redemption_count, 2);
}

#[rstest]
#[tokio::test]
async fn resume_and_renewal_sweep_share_one_redemption() {
    let fx = fixture().await;
    fx.lifecycle
        .pause(fx.subscription.id, Some(day(20)), day(10))
        .await
        .unwrap();
    fx.execution
        .set_delay(Some(std::time::Duration::from_millis(50)))
        .await;
    let (changes, renewals) = (fx.processor(), fx.redemptions());

    let (changes, renewals) =
        tokio::join!(changes.run_sweep(day(20)), renewals.run_sweep(day(20)));
    changes.unwrap();
    renewals.unwrap();
    let follow_up = fx.redemptions().run_sweep(day(20)).await.unwrap();

    assert_eq!(follow_up.settled, 0);
    assert_eq!(fx.execution.submission_count().await, 2);
    let resumed = fx.reload().await;
    assert_eq!(resumed.status, SubscriptionStatus::Active);
    assert_eq!(resumed.redemption_count, 2);
    assert_eq!(resumed.next_redemption_at, Some(day(50)));
}
