use chainbill_core::{
    BillingError, BillingResult, LineItem, Product, SettlementPurpose, Subscription,
    SubscriptionStatus, line_items_total,
};
use chainbill_proration::add_billing_period;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::transitions::can_transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedemptionEffect {
    /// `false` when the transaction was already applied to this row.
    pub applied: bool,
    pub completed: bool,
    pub previous_status: SubscriptionStatus,
}

/// Redemptions left before the product's term is exhausted; `None` when unbounded.
pub fn remaining_redemptions(subscription: &Subscription, product: &Product) -> Option<u32> {
    if product.billing_interval().is_none() {
        return Some(u32::from(subscription.redemption_count == 0));
    }
    product
        .term_length
        .map(|term| term.saturating_sub(subscription.redemption_count))
}

/// Rejects a period-advancing redemption the term no longer allows.
pub fn ensure_redeemable(subscription: &Subscription, product: &Product) -> BillingResult<()> {
    if remaining_redemptions(subscription, product) == Some(0) {
        return Err(BillingError::validation(format!(
            "subscription {} has no redemptions left in its term",
            subscription.id
        )));
    }
    Ok(())
}

/// Row for a subscription whose initial settlement just confirmed. Nothing is due until the
/// initial redemption is applied, so a crash between the two writes never re-charges.
#[allow(clippy::too_many_arguments)]
pub fn initial_subscription(
    id: Uuid,
    workspace_id: Uuid,
    customer_id: Uuid,
    product: &Product,
    line_items: Vec<LineItem>,
    currency: String,
    delegation_id: Uuid,
    started_at: DateTime<Utc>,
) -> BillingResult<Subscription> {
    if line_items.is_empty() {
        return Err(BillingError::validation("a subscription needs line items"));
    }

    let period_end = match product.billing_interval() {
        Some(interval) => add_billing_period(started_at, interval.unit, interval.count)?,
        None => started_at + Duration::days(1),
    };

    Ok(Subscription {
        id,
        workspace_id,
        customer_id,
        product_id: product.id,
        amount: line_items_total(&line_items),
        line_items,
        currency,
        status: SubscriptionStatus::Active,
        current_period_start: started_at,
        current_period_end: period_end,
        next_redemption_at: None,
        pause_until: None,
        cancel_at: None,
        redemption_count: 0,
        total_charged: Decimal::ZERO,
        delegation_id,
        last_settlement_ref: None,
        metadata: serde_json::Value::Object(Default::default()),
        created_at: started_at,
        updated_at: started_at,
    })
}

/// Ledger update for one confirmed settlement, idempotent per transaction reference.
pub fn apply_redemption(
    subscription: &mut Subscription,
    product: &Product,
    purpose: SettlementPurpose,
    amount: Decimal,
    transaction_ref: &str,
    period_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> BillingResult<RedemptionEffect> {
    let previous_status = subscription.status;
    if subscription.last_settlement_ref.as_deref() == Some(transaction_ref) {
        return Ok(RedemptionEffect {
            applied: false,
            completed: false,
            previous_status,
        });
    }

    let mut completed = false;
    if purpose.advances_period() {
        ensure_redeemable(subscription, product)?;

        subscription.redemption_count += 1;
        match product.billing_interval() {
            Some(interval) => {
                let start = period_start
                    .or(subscription.next_redemption_at)
                    .unwrap_or(now);
                subscription.current_period_start = start;
                subscription.current_period_end =
                    add_billing_period(start, interval.unit, interval.count)?;
                subscription.next_redemption_at = Some(subscription.current_period_end);
                completed = product
                    .term_length
                    .is_some_and(|term| subscription.redemption_count >= term);
            }
            None => completed = true,
        }

        if completed {
            subscription.next_redemption_at = None;
            if can_transition(subscription.status, SubscriptionStatus::Completed) {
                subscription.status = SubscriptionStatus::Completed;
            }
        }
    }

    subscription.total_charged += amount;
    subscription.last_settlement_ref = Some(transaction_ref.to_string());
    subscription.updated_at = now;

    Ok(RedemptionEffect {
        applied: true,
        completed,
        previous_status,
    })
}

#[cfg(test)]
mod tests {
    use chainbill_core::{BillingInterval, IntervalUnit};
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() + Duration::days(offset)
    }

    fn product(term_length: Option<u32>, recurring: bool) -> Product {
        Product {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "Pro".to_string(),
            recurring,
            interval: Some(BillingInterval {
                unit: IntervalUnit::Day,
                count: 30,
            }),
            term_length,
            currency: "USDC".to_string(),
        }
    }

    fn items() -> Vec<LineItem> {
        vec![LineItem {
            price_id: Uuid::new_v4(),
            description: "seat".to_string(),
            quantity: 2,
            unit_amount: Decimal::from(50),
        }]
    }

    fn fresh(product: &Product) -> Subscription {
        initial_subscription(
            Uuid::new_v4(),
            product.workspace_id,
            Uuid::new_v4(),
            product,
            items(),
            "USDC".to_string(),
            Uuid::new_v4(),
            day(0),
        )
        .unwrap()
    }

    fn checkout(subscription: &mut Subscription, product: &Product) -> RedemptionEffect {
        apply_redemption(
            subscription,
            product,
            SettlementPurpose::Initial,
            Decimal::from(100),
            "0xa",
            Some(day(0)),
            day(0),
        )
        .unwrap()
    }

    fn redeem(
        subscription: &mut Subscription,
        product: &Product,
        purpose: SettlementPurpose,
        amount: i64,
        transaction_ref: &str,
        now: DateTime<Utc>,
    ) -> RedemptionEffect {
        apply_redemption(
            subscription,
            product,
            purpose,
            Decimal::from(amount),
            transaction_ref,
            None,
            now,
        )
        .unwrap()
    }

    #[rstest]
    fn initial_row_has_nothing_due() {
        let product = product(None, true);
        let subscription = fresh(&product);

        assert_eq!(subscription.amount, Decimal::from(100));
        assert_eq!(subscription.current_period_end, day(30));
        assert_eq!(subscription.next_redemption_at, None);
    }

    #[rstest]
    fn redemptions_stop_at_term_length() {
        let product = product(Some(3), true);
        let mut subscription = fresh(&product);

        for (index, reference) in ["0x1", "0x2", "0x3"].iter().enumerate() {
            let start = if index == 0 { Some(day(0)) } else { None };
            let effect = apply_redemption(
                &mut subscription,
                &product,
                if index == 0 { SettlementPurpose::Initial } else { SettlementPurpose::Renewal },
                Decimal::from(100),
                reference,
                start,
                day(30 * index as i64),
            )
            .unwrap();
            assert_eq!(effect.completed, index == 2);
        }

        assert_eq!(subscription.redemption_count, 3);
        assert_eq!(subscription.status, SubscriptionStatus::Completed);
        assert_eq!(subscription.next_redemption_at, None);
        assert_eq!(subscription.total_charged, Decimal::from(300));

        let extra = apply_redemption(
            &mut subscription,
            &product,
            SettlementPurpose::Renewal,
            Decimal::from(100),
            "0x4",
            None,
            day(90),
        );
        assert!(extra.is_err());
        assert_eq!(subscription.redemption_count, 3);
    }

    #[rstest]
    fn renewal_starts_at_previous_due_date() {
        let product = product(None, true);
        let mut subscription = fresh(&product);
        checkout(&mut subscription, &product);

        redeem(&mut subscription, &product, SettlementPurpose::Renewal, 100, "0xb", day(31));

        assert_eq!(subscription.current_period_start, day(30));
        assert_eq!(subscription.current_period_end, day(60));
        assert_eq!(subscription.next_redemption_at, Some(day(60)));
    }

    #[rstest]
    fn same_transaction_applies_once() {
        let product = product(None, true);
        let mut subscription = fresh(&product);
        checkout(&mut subscription, &product);
        let again = checkout(&mut subscription, &product);

        assert!(!again.applied);
        assert_eq!(subscription.redemption_count, 1);
        assert_eq!(subscription.total_charged, Decimal::from(100));
    }

    #[rstest]
    fn one_time_product_completes_after_single_redemption() {
        let product = product(None, false);
        let mut subscription = fresh(&product);
        let effect = checkout(&mut subscription, &product);

        assert!(effect.completed);
        assert_eq!(subscription.status, SubscriptionStatus::Completed);
        assert_eq!(remaining_redemptions(&subscription, &product), Some(0));
    }

    #[rstest]
    fn proration_charge_does_not_advance_the_period() {
        let product = product(Some(2), true);
        let mut subscription = fresh(&product);
        checkout(&mut subscription, &product);
        redeem(&mut subscription, &product, SettlementPurpose::Proration, 40, "0xb", day(10));

        assert_eq!(subscription.redemption_count, 1);
        assert_eq!(subscription.total_charged, Decimal::from(140));
        assert_eq!(subscription.next_redemption_at, Some(day(30)));
    }
}
