//! Proration math for mid-cycle plan changes and pauses.
//!
//! Every function here is pure. Periods are measured in whole days; a period shorter than a
//! day counts as one day, so `days_total` is never zero and such a period is charged or
//! credited in full. `now` is clamped into the period. Amounts keep six decimal places.

use chainbill_core::{
    BillingError, BillingResult, ChangeType, IntervalUnit, ProrationKind, ProrationRecord,
};
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const AMOUNT_SCALE: u32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProrationCalculation {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub days_total: i64,
    pub days_used: i64,
    pub days_remaining: i64,
    pub original_amount: Decimal,
    pub new_amount: Decimal,
    pub used_amount: Decimal,
    pub credit_amount: Decimal,
    pub charge_amount: Decimal,
    /// `charge_amount - credit_amount`; nothing is due immediately when this is not positive.
    pub net_amount: Decimal,
}

impl ProrationCalculation {
    pub fn amount_due(&self) -> Decimal {
        self.net_amount.max(Decimal::ZERO)
    }

    pub fn to_record(
        &self,
        subscription_id: Uuid,
        kind: ProrationKind,
        now: DateTime<Utc>,
    ) -> ProrationRecord {
        ProrationRecord {
            id: Uuid::new_v4(),
            subscription_id,
            kind,
            period_start: self.period_start,
            period_end: self.period_end,
            days_total: self.days_total,
            days_used: self.days_used,
            days_remaining: self.days_remaining,
            original_amount: self.original_amount,
            used_amount: self.used_amount,
            credit_amount: self.credit_amount,
            charge_amount: self.charge_amount,
            net_amount: self.net_amount,
            invoice_id: None,
            payment_id: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScheduledEffect {
    pub effective_at: DateTime<Utc>,
    pub proration_amount: Decimal,
}

struct PeriodDays {
    total: i64,
    used: i64,
    remaining: i64,
}

fn period_days(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> BillingResult<PeriodDays> {
    if period_end <= period_start {
        return Err(BillingError::validation(
            "period_end must be after period_start",
        ));
    }

    let total = (period_end - period_start).num_days().max(1);
    let elapsed = now.clamp(period_start, period_end) - period_start;
    let used = elapsed.num_days().min(total);

    Ok(PeriodDays {
        total,
        used,
        remaining: total - used,
    })
}

fn portion(amount: Decimal, days: i64, total: i64) -> Decimal {
    (amount * Decimal::from(days) / Decimal::from(total)).round_dp(AMOUNT_SCALE)
}

fn ensure_non_negative(amount: Decimal, field: &str) -> BillingResult<()> {
    if amount < Decimal::ZERO {
        return Err(BillingError::validation(format!(
            "{field} must not be negative"
        )));
    }
    Ok(())
}

/// Credit for the unused part of the old plan against a charge for the same days on the new one.
pub fn upgrade_proration(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    old_amount: Decimal,
    new_amount: Decimal,
    now: DateTime<Utc>,
) -> BillingResult<ProrationCalculation> {
    ensure_non_negative(old_amount, "old_amount")?;
    ensure_non_negative(new_amount, "new_amount")?;
    let days = period_days(period_start, period_end, now)?;

    let credit_amount = portion(old_amount, days.remaining, days.total);
    let charge_amount = portion(new_amount, days.remaining, days.total);

    Ok(ProrationCalculation {
        period_start,
        period_end,
        days_total: days.total,
        days_used: days.used,
        days_remaining: days.remaining,
        original_amount: old_amount,
        new_amount,
        used_amount: portion(old_amount, days.used, days.total),
        credit_amount,
        charge_amount,
        net_amount: charge_amount - credit_amount,
    })
}

/// Downgrades and cancellations take effect at period end and never prorate.
pub fn schedule_downgrade(
    period_end: DateTime<Utc>,
    change_type: ChangeType,
) -> BillingResult<ScheduledEffect> {
    match change_type {
        ChangeType::Downgrade | ChangeType::Cancel => Ok(ScheduledEffect {
            effective_at: period_end,
            proration_amount: Decimal::ZERO,
        }),
        other => Err(BillingError::validation(format!(
            "{other} changes are not deferred to period end"
        ))),
    }
}

pub fn pause_credit(
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    amount: Decimal,
    now: DateTime<Utc>,
) -> BillingResult<ProrationCalculation> {
    ensure_non_negative(amount, "amount")?;
    let days = period_days(period_start, period_end, now)?;
    let credit_amount = portion(amount, days.remaining, days.total);

    Ok(ProrationCalculation {
        period_start,
        period_end,
        days_total: days.total,
        days_used: days.used,
        days_remaining: days.remaining,
        original_amount: amount,
        new_amount: Decimal::ZERO,
        used_amount: portion(amount, days.used, days.total),
        credit_amount,
        charge_amount: Decimal::ZERO,
        net_amount: -credit_amount,
    })
}

/// Next period boundary. Month and year steps are calendar steps, clamped to the last day of
/// shorter months (Jan 31 + 1 month = Feb 28).
pub fn add_billing_period(
    start: DateTime<Utc>,
    unit: IntervalUnit,
    count: u32,
) -> BillingResult<DateTime<Utc>> {
    if count == 0 {
        return Err(BillingError::validation("interval count must be positive"));
    }

    let next = match unit {
        IntervalUnit::Day => start.checked_add_signed(Duration::days(i64::from(count))),
        IntervalUnit::Week => start.checked_add_signed(Duration::weeks(i64::from(count))),
        IntervalUnit::Month => start.checked_add_months(Months::new(count)),
        IntervalUnit::Year => count
            .checked_mul(12)
            .and_then(|months| start.checked_add_months(Months::new(months))),
    };

    next.ok_or_else(|| BillingError::validation("billing period overflows the calendar"))
}

/// Preview text for customers; carries no semantics.
pub fn format_proration_explanation(calculation: &ProrationCalculation) -> String {
    let mut text = format!(
        "{} of {} days remain in the current period. Unused credit: {}.",
        calculation.days_remaining,
        calculation.days_total,
        calculation.credit_amount.round_dp(2)
    );

    if calculation.charge_amount > Decimal::ZERO {
        text.push_str(&format!(
            " New plan for the remaining days: {}.",
            calculation.charge_amount.round_dp(2)
        ));
    }

    if calculation.net_amount > Decimal::ZERO {
        text.push_str(&format!(
            " Due now: {}.",
            calculation.net_amount.round_dp(2)
        ));
    } else {
        text.push_str(&format!(
            " Nothing is due now; {} is credited.",
            (-calculation.net_amount).round_dp(2)
        ));
    }

    text
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn day(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::days(offset)
    }

    fn amount(value: i64) -> Decimal {
        Decimal::from(value)
    }

    #[rstest]
    fn upgrade_mid_cycle_charges_the_difference() {
        let calc = upgrade_proration(day(0), day(30), amount(1000), amount(2000), day(10)).unwrap();

        assert_eq!(calc.days_total, 30);
        assert_eq!(calc.days_used, 10);
        assert_eq!(calc.days_remaining, 20);
        assert_eq!(calc.credit_amount.round_dp(2), Decimal::new(66667, 2));
        assert_eq!(calc.charge_amount.round_dp(2), Decimal::new(133333, 2));
        assert_eq!(calc.net_amount.round_dp(2), Decimal::new(66667, 2));
        assert_eq!(calc.amount_due(), calc.net_amount);
    }

    #[rstest]
    fn cheaper_plan_yields_no_immediate_charge() {
        let calc = upgrade_proration(day(0), day(30), amount(2000), amount(1000), day(15)).unwrap();

        assert!(calc.net_amount < Decimal::ZERO);
        assert_eq!(calc.amount_due(), Decimal::ZERO);
    }

    #[rstest]
    #[case(day(-5), 0, 30)]
    #[case(day(45), 30, 0)]
    fn now_is_clamped_into_the_period(
        #[case] now: DateTime<Utc>,
        #[case] used: i64,
        #[case] remaining: i64,
    ) {
        let calc = upgrade_proration(day(0), day(30), amount(300), amount(600), now).unwrap();
        assert_eq!(calc.days_used, used);
        assert_eq!(calc.days_remaining, remaining);
    }

    #[rstest]
    fn sub_day_period_counts_as_one_full_day() {
        let start = day(0);
        let end = start + Duration::hours(6);
        let calc = upgrade_proration(start, end, amount(100), amount(200), start).unwrap();

        assert_eq!(calc.days_total, 1);
        assert_eq!(calc.credit_amount, amount(100));
        assert_eq!(calc.charge_amount, amount(200));
    }

    #[rstest]
    fn inverted_period_is_rejected() {
        let result = upgrade_proration(day(10), day(10), amount(1), amount(2), day(10));
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[rstest]
    #[case(ChangeType::Downgrade)]
    #[case(ChangeType::Cancel)]
    fn deferred_changes_land_on_period_end_without_proration(#[case] change_type: ChangeType) {
        let effect = schedule_downgrade(day(30), change_type).unwrap();
        assert_eq!(effect.effective_at, day(30));
        assert_eq!(effect.proration_amount, Decimal::ZERO);
    }

    #[rstest]
    fn upgrades_are_not_deferred() {
        assert!(schedule_downgrade(day(30), ChangeType::Upgrade).is_err());
    }

    #[rstest]
    fn pause_credit_matches_upgrade_credit_formula() {
        let pause = pause_credit(day(0), day(30), amount(900), day(12)).unwrap();
        let upgrade = upgrade_proration(day(0), day(30), amount(900), amount(0), day(12)).unwrap();

        assert_eq!(pause.credit_amount, upgrade.credit_amount);
        assert_eq!(pause.credit_amount, amount(540));
        assert_eq!(pause.net_amount, -pause.credit_amount);
    }

    #[rstest]
    #[case(day(0), IntervalUnit::Day, 10, day(10))]
    #[case(day(0), IntervalUnit::Week, 2, day(14))]
    #[case(
        Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap(),
        IntervalUnit::Month,
        1,
        Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap()
    )]
    #[case(
        Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap(),
        IntervalUnit::Year,
        1,
        Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap()
    )]
    #[case(
        Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap(),
        IntervalUnit::Month,
        3,
        Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap()
    )]
    fn billing_periods_follow_the_calendar(
        #[case] start: DateTime<Utc>,
        #[case] unit: IntervalUnit,
        #[case] count: u32,
        #[case] expected: DateTime<Utc>,
    ) {
        assert_eq!(add_billing_period(start, unit, count).unwrap(), expected);
    }

    #[rstest]
    fn zero_interval_is_rejected() {
        assert!(add_billing_period(day(0), IntervalUnit::Month, 0).is_err());
    }

    #[rstest]
    fn explanation_mentions_amount_due() {
        let calc = upgrade_proration(day(0), day(30), amount(1000), amount(2000), day(10)).unwrap();
        let text = format_proration_explanation(&calc);

        assert!(text.starts_with("20 of 30 days remain"));
        assert!(text.contains("Due now: 666.67."));
    }

    #[rstest]
    fn record_carries_the_calculation() {
        let calc = pause_credit(day(0), day(30), amount(300), day(20)).unwrap();
        let subscription_id = Uuid::new_v4();
        let record = calc.to_record(subscription_id, ProrationKind::Pause, day(20));

        assert_eq!(record.subscription_id, subscription_id);
        assert_eq!(record.days_remaining, 10);
        assert_eq!(record.credit_amount, amount(100));
        assert_eq!(record.payment_id, None);
    }

    proptest! {
        #[test]
        fn upgrade_days_partition_the_period(
            length_hours in 1i64..(400 * 24),
            now_hours in -240i64..(420 * 24),
            old in 0i64..1_000_000,
            new in 0i64..1_000_000,
        ) {
            let start = day(0);
            let end = start + Duration::hours(length_hours);
            let now = start + Duration::hours(now_hours);
            let calc = upgrade_proration(start, end, Decimal::from(old), Decimal::from(new), now).unwrap();

            prop_assert!(calc.days_total > 0);
            prop_assert_eq!(calc.days_used + calc.days_remaining, calc.days_total);
            prop_assert!(calc.credit_amount >= Decimal::ZERO);
            prop_assert!(calc.credit_amount <= Decimal::from(old));
        }
    }
}
