use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Delegation, LineItem, Product, SettlementPurpose};

/// Everything the executor needs to settle one logical redemption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementContext {
    pub purpose: SettlementPurpose,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    /// Pre-allocated for initial settlements; the row is only written after confirmation.
    pub subscription_id: Option<Uuid>,
    pub product: Product,
    pub line_items: Vec<LineItem>,
    pub delegation: Delegation,
    pub amount: Decimal,
    pub currency: String,
    /// Redemption number this settlement pays for (1-based).
    pub sequence: u32,
    /// Scheduled change for proration charges, order for one-time purchases.
    pub reference_id: Option<Uuid>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl SettlementContext {
    /// Stable description of the logical redemption; hashed into the idempotency key.
    pub fn logical_redemption(&self) -> String {
        let owner = self
            .subscription_id
            .or(self.reference_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|| self.delegation.id.to_string());
        let reference = self
            .reference_id
            .map(|id| id.to_string())
            .unwrap_or_default();

        format!(
            "{owner}:{}:{}:{reference}",
            self.purpose.as_str(),
            self.sequence
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookkeepingStep {
    SubscriptionCreated,
    EventRecorded,
    PaymentRecorded,
    RedemptionApplied,
    WalletTouched,
}

impl BookkeepingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookkeepingStep::SubscriptionCreated => "subscription_created",
            BookkeepingStep::EventRecorded => "event_recorded",
            BookkeepingStep::PaymentRecorded => "payment_recorded",
            BookkeepingStep::RedemptionApplied => "redemption_applied",
            BookkeepingStep::WalletTouched => "wallet_touched",
        }
    }
}

impl fmt::Display for BookkeepingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amount actually submitted for a context, after discount and tax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChargeQuote {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub tax_breakdown: serde_json::Value,
}

impl ChargeQuote {
    pub fn untaxed(amount: Decimal) -> Self {
        Self {
            subtotal: amount,
            discount: Decimal::ZERO,
            tax: Decimal::ZERO,
            total: amount,
            tax_breakdown: serde_json::Value::Null,
        }
    }
}

/// Progress marker for a submitted settlement, keyed by idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementReceipt {
    pub idempotency_key: String,
    pub transaction_ref: String,
    pub context: SettlementContext,
    pub quote: ChargeQuote,
    pub completed_steps: Vec<BookkeepingStep>,
    pub completed: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementReceipt {
    pub fn has_completed(&self, step: BookkeepingStep) -> bool {
        self.completed_steps.contains(&step)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SettlementErrorKind {
    Validation,
    ServiceUnavailable,
    Rejected,
    Bookkeeping,
}

impl SettlementErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementErrorKind::Validation => "validation",
            SettlementErrorKind::ServiceUnavailable => "execution_service_unavailable",
            SettlementErrorKind::Rejected => "execution_rejected",
            SettlementErrorKind::Bookkeeping => "bookkeeping_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "validation" => Some(SettlementErrorKind::Validation),
            "execution_service_unavailable" => Some(SettlementErrorKind::ServiceUnavailable),
            "execution_rejected" => Some(SettlementErrorKind::Rejected),
            "bookkeeping_failure" => Some(SettlementErrorKind::Bookkeeping),
            _ => None,
        }
    }

    /// Only these kinds may be retried as a fresh submission.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlementErrorKind::Validation | SettlementErrorKind::ServiceUnavailable
        )
    }
}

/// Structured record of a failed settlement attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementFailure {
    pub id: Uuid,
    pub idempotency_key: String,
    pub kind: SettlementErrorKind,
    pub message: String,
    pub wallet_address: String,
    pub transaction_ref: Option<String>,
    pub completed_steps: Vec<BookkeepingStep>,
    /// Set together with `transaction_ref` once a transfer was confirmed.
    #[serde(default)]
    pub quote: Option<ChargeQuote>,
    pub context: SettlementContext,
    pub occurred_at: DateTime<Utc>,
}

impl SettlementFailure {
    /// Rebuilds the progress marker of a confirmed transfer whose receipt was never stored.
    pub fn confirmed_receipt(&self) -> Option<SettlementReceipt> {
        let transaction_ref = self.transaction_ref.clone()?;
        let quote = self.quote.clone()?;
        Some(SettlementReceipt {
            idempotency_key: self.idempotency_key.clone(),
            transaction_ref,
            context: self.context.clone(),
            quote,
            completed_steps: self.completed_steps.clone(),
            completed: false,
            submitted_at: self.occurred_at,
            updated_at: self.occurred_at,
        })
    }
}
