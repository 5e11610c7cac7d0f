//! Builders for the settlement contexts of each purpose, and the idempotency key derived from
//! them.

use chainbill_core::{
    BillingError, BillingResult, CatalogStore, Delegation, LineItem, Product, RecordStore,
    SettlementContext, SettlementPurpose, Subscription, line_items_total,
};
use chainbill_lifecycle::ensure_redeemable;
use chainbill_proration::add_billing_period;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Hex SHA-256 of the logical redemption. Retries of the same redemption always share it.
pub fn idempotency_key(context: &SettlementContext) -> String {
    format!("{:x}", Sha256::digest(context.logical_redemption().as_bytes()))
}

async fn load_product(store: &dyn RecordStore, id: Uuid) -> BillingResult<Product> {
    store
        .product(id)
        .await?
        .ok_or_else(|| BillingError::not_found("product", id))
}

async fn load_delegation(store: &dyn RecordStore, id: Uuid) -> BillingResult<Delegation> {
    store
        .delegation(id)
        .await?
        .ok_or_else(|| BillingError::not_found("delegation", id))
}

fn period_after(product: &Product, start: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
    match product.billing_interval() {
        Some(interval) => add_billing_period(start, interval.unit, interval.count),
        None => Ok(start + Duration::days(1)),
    }
}

/// Checkout of a new subscription. The subscription id is allocated here and the row is only
/// written once the transfer confirms.
pub async fn initial_context(
    store: &dyn RecordStore,
    customer_id: Uuid,
    product_id: Uuid,
    delegation_id: Uuid,
    line_items: Vec<LineItem>,
    now: DateTime<Utc>,
) -> BillingResult<SettlementContext> {
    let product = load_product(store, product_id).await?;
    let delegation = load_delegation(store, delegation_id).await?;
    let period_end = period_after(&product, now)?;

    Ok(SettlementContext {
        purpose: SettlementPurpose::Initial,
        workspace_id: product.workspace_id,
        customer_id,
        subscription_id: Some(Uuid::new_v4()),
        amount: line_items_total(&line_items),
        currency: product.currency.clone(),
        product,
        line_items,
        delegation,
        sequence: 1,
        reference_id: None,
        period_start: Some(now),
        period_end: Some(period_end),
    })
}

/// The next due period of an existing subscription. Overdue rows keep their missed due date,
/// so dunning retries rebuild the same context and the same key.
pub async fn renewal_context(
    store: &dyn RecordStore,
    subscription: &Subscription,
) -> BillingResult<SettlementContext> {
    let product = load_product(store, subscription.product_id).await?;
    ensure_redeemable(subscription, &product)?;
    let delegation = load_delegation(store, subscription.delegation_id).await?;
    let period_start = subscription.next_redemption_at.ok_or_else(|| {
        BillingError::validation(format!(
            "subscription {} has no redemption due",
            subscription.id
        ))
    })?;
    let period_end = period_after(&product, period_start)?;

    Ok(SettlementContext {
        purpose: SettlementPurpose::Renewal,
        workspace_id: subscription.workspace_id,
        customer_id: subscription.customer_id,
        subscription_id: Some(subscription.id),
        product,
        line_items: subscription.line_items.clone(),
        delegation,
        amount: subscription.amount,
        currency: subscription.currency.clone(),
        sequence: subscription.redemption_count + 1,
        reference_id: None,
        period_start: Some(period_start),
        period_end: Some(period_end),
    })
}

/// Immediate charge for an upgrade's net proration, tied to the completed change.
pub async fn proration_context(
    store: &dyn RecordStore,
    subscription: &Subscription,
    change_id: Uuid,
    amount: Decimal,
) -> BillingResult<SettlementContext> {
    let product = load_product(store, subscription.product_id).await?;
    let delegation = load_delegation(store, subscription.delegation_id).await?;

    Ok(SettlementContext {
        purpose: SettlementPurpose::Proration,
        workspace_id: subscription.workspace_id,
        customer_id: subscription.customer_id,
        subscription_id: Some(subscription.id),
        product,
        line_items: subscription.line_items.clone(),
        delegation,
        amount,
        currency: subscription.currency.clone(),
        sequence: subscription.redemption_count,
        reference_id: Some(change_id),
        period_start: Some(subscription.current_period_start),
        period_end: Some(subscription.current_period_end),
    })
}

/// Standalone purchase that creates no subscription.
pub async fn one_time_context(
    store: &dyn RecordStore,
    order_id: Uuid,
    customer_id: Uuid,
    product_id: Uuid,
    delegation_id: Uuid,
    line_items: Vec<LineItem>,
) -> BillingResult<SettlementContext> {
    let product = load_product(store, product_id).await?;
    let delegation = load_delegation(store, delegation_id).await?;

    Ok(SettlementContext {
        purpose: SettlementPurpose::OneTime,
        workspace_id: product.workspace_id,
        customer_id,
        subscription_id: None,
        amount: line_items_total(&line_items),
        currency: product.currency.clone(),
        product,
        line_items,
        delegation,
        sequence: 1,
        reference_id: Some(order_id),
        period_start: None,
        period_end: None,
    })
}

/// Checks that need no I/O. Runs before anything is submitted.
pub fn validate_context(context: &SettlementContext, now: DateTime<Utc>) -> Result<(), String> {
    if context.amount <= Decimal::ZERO {
        return Err(format!("amount must be positive, got {}", context.amount));
    }
    if context.line_items.is_empty() {
        return Err("at least one line item is required".to_string());
    }
    if context.currency.trim().is_empty() {
        return Err("currency is required".to_string());
    }
    if context.delegation.customer_id != context.customer_id {
        return Err(format!(
            "delegation {} does not belong to customer {}",
            context.delegation.id, context.customer_id
        ));
    }
    if context.delegation.is_expired(now) {
        return Err(format!("delegation {} has expired", context.delegation.id));
    }
    if context.delegation.wallet_address.trim().is_empty() {
        return Err("delegation has no wallet address".to_string());
    }

    match context.purpose {
        SettlementPurpose::Initial | SettlementPurpose::Renewal
            if context.subscription_id.is_none() =>
        {
            Err("a period settlement needs a subscription id".to_string())
        }
        SettlementPurpose::Proration
            if context.subscription_id.is_none() || context.reference_id.is_none() =>
        {
            Err("a proration charge needs a subscription and a change reference".to_string())
        }
        SettlementPurpose::OneTime if context.reference_id.is_none() => {
            Err("a one-time settlement needs an order reference".to_string())
        }
        _ => Ok(()),
    }
}
