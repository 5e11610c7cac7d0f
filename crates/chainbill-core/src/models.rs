use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Suspended,
    Overdue,
    Cancelled,
    Expired,
    Completed,
    Failed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Overdue => "overdue",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Completed => "completed",
            SubscriptionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(SubscriptionStatus::Active),
            "paused" => Some(SubscriptionStatus::Paused),
            "suspended" => Some(SubscriptionStatus::Suspended),
            "overdue" => Some(SubscriptionStatus::Overdue),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            "completed" => Some(SubscriptionStatus::Completed),
            "failed" => Some(SubscriptionStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never transition again and may be deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled
                | SubscriptionStatus::Expired
                | SubscriptionStatus::Completed
                | SubscriptionStatus::Failed
        )
    }

    /// Statuses during which a next redemption may be scheduled.
    pub fn accrues_redemptions(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Overdue)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
            IntervalUnit::Year => "year",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" => Some(IntervalUnit::Day),
            "week" => Some(IntervalUnit::Week),
            "month" => Some(IntervalUnit::Month),
            "year" => Some(IntervalUnit::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingInterval {
    pub unit: IntervalUnit,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub recurring: bool,
    pub interval: Option<BillingInterval>,
    /// Maximum number of redemptions for a recurring product; `None` renews until cancelled.
    pub term_length: Option<u32>,
    pub currency: String,
}

impl Product {
    pub fn billing_interval(&self) -> Option<BillingInterval> {
        if self.recurring { self.interval } else { None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub price_id: Uuid,
    pub description: String,
    pub quantity: u32,
    pub unit_amount: Decimal,
}

impl LineItem {
    pub fn total(&self) -> Decimal {
        self.unit_amount * Decimal::from(self.quantity)
    }
}

pub fn line_items_total(items: &[LineItem]) -> Decimal {
    items.iter().map(LineItem::total).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delegation {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub wallet_address: String,
    pub token_address: String,
    pub network_id: String,
    /// Signed authorization handed to the execution service.
    pub proof: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Delegation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub in_app_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub product_id: Uuid,
    pub line_items: Vec<LineItem>,
    pub amount: Decimal,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub next_redemption_at: Option<DateTime<Utc>>,
    pub pause_until: Option<DateTime<Utc>>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub redemption_count: u32,
    pub total_charged: Decimal,
    pub delegation_id: Uuid,
    /// Transaction reference of the last settlement applied to this row.
    pub last_settlement_ref: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Overdue rows keep their missed due date but are retried by dunning, not renewal.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.next_redemption_at.is_some_and(|due| due <= now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Upgrade,
    Downgrade,
    Cancel,
    Pause,
    Resume,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upgrade => "upgrade",
            ChangeType::Downgrade => "downgrade",
            ChangeType::Cancel => "cancel",
            ChangeType::Pause => "pause",
            ChangeType::Resume => "resume",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "upgrade" => Some(ChangeType::Upgrade),
            "downgrade" => Some(ChangeType::Downgrade),
            "cancel" => Some(ChangeType::Cancel),
            "pause" => Some(ChangeType::Pause),
            "resume" => Some(ChangeType::Resume),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Scheduled,
    Processing,
    Completed,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Scheduled => "scheduled",
            ChangeStatus::Processing => "processing",
            ChangeStatus::Completed => "completed",
            ChangeStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(ChangeStatus::Scheduled),
            "processing" => Some(ChangeStatus::Processing),
            "completed" => Some(ChangeStatus::Completed),
            "failed" => Some(ChangeStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledChange {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub change_type: ChangeType,
    pub effective_at: DateTime<Utc>,
    pub before_items: Vec<LineItem>,
    pub after_items: Vec<LineItem>,
    pub proration_amount: Option<Decimal>,
    pub status: ChangeStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ScheduledChange {
    pub fn scheduled(
        subscription_id: Uuid,
        change_type: ChangeType,
        effective_at: DateTime<Utc>,
        before_items: Vec<LineItem>,
        after_items: Vec<LineItem>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            change_type,
            effective_at,
            before_items,
            after_items,
            proration_amount: None,
            status: ChangeStatus::Scheduled,
            error_message: None,
            created_at: now,
            processed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProrationKind {
    Upgrade,
    Pause,
}

impl ProrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationKind::Upgrade => "upgrade",
            ProrationKind::Pause => "pause",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "upgrade" => Some(ProrationKind::Upgrade),
            "pause" => Some(ProrationKind::Pause),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProrationRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub kind: ProrationKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub days_total: i64,
    pub days_used: i64,
    pub days_remaining: i64,
    pub original_amount: Decimal,
    pub used_amount: Decimal,
    pub credit_amount: Decimal,
    pub charge_amount: Decimal,
    pub net_amount: Decimal,
    pub invoice_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPurpose {
    Initial,
    Renewal,
    Proration,
    OneTime,
}

impl SettlementPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementPurpose::Initial => "initial",
            SettlementPurpose::Renewal => "renewal",
            SettlementPurpose::Proration => "proration",
            SettlementPurpose::OneTime => "one_time",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initial" => Some(SettlementPurpose::Initial),
            "renewal" => Some(SettlementPurpose::Renewal),
            "proration" => Some(SettlementPurpose::Proration),
            "one_time" => Some(SettlementPurpose::OneTime),
            _ => None,
        }
    }

    /// Purposes that pay for a billing period and advance the redemption counter.
    pub fn advances_period(&self) -> bool {
        matches!(self, SettlementPurpose::Initial | SettlementPurpose::Renewal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub transaction_ref: String,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    /// Total transferred on chain: `subtotal - discount + tax`.
    pub amount: Decimal,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub tax_breakdown: serde_json::Value,
    pub currency: String,
    pub purpose: SettlementPurpose,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub invoice_id: Option<Uuid>,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    pub id: Uuid,
    pub number: String,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub payment_id: Uuid,
    pub purpose: SettlementPurpose,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub tax_breakdown: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}
