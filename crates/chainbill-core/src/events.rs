use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::SubscriptionStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEventKind {
    Created,
    Redeemed,
    Completed,
    Failed,
    Upgraded,
    DowngradeScheduled,
    Downgraded,
    CancellationScheduled,
    Cancelled,
    Reactivated,
    Paused,
    Resumed,
    Overdue,
    Recovered,
    Expired,
}

impl SubscriptionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEventKind::Created => "created",
            SubscriptionEventKind::Redeemed => "redeemed",
            SubscriptionEventKind::Completed => "completed",
            SubscriptionEventKind::Failed => "failed",
            SubscriptionEventKind::Upgraded => "upgraded",
            SubscriptionEventKind::DowngradeScheduled => "downgrade_scheduled",
            SubscriptionEventKind::Downgraded => "downgraded",
            SubscriptionEventKind::CancellationScheduled => "cancellation_scheduled",
            SubscriptionEventKind::Cancelled => "cancelled",
            SubscriptionEventKind::Reactivated => "reactivated",
            SubscriptionEventKind::Paused => "paused",
            SubscriptionEventKind::Resumed => "resumed",
            SubscriptionEventKind::Overdue => "overdue",
            SubscriptionEventKind::Recovered => "recovered",
            SubscriptionEventKind::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value.trim().to_ascii_lowercase().as_str() {
            "created" => SubscriptionEventKind::Created,
            "redeemed" => SubscriptionEventKind::Redeemed,
            "completed" => SubscriptionEventKind::Completed,
            "failed" => SubscriptionEventKind::Failed,
            "upgraded" => SubscriptionEventKind::Upgraded,
            "downgrade_scheduled" => SubscriptionEventKind::DowngradeScheduled,
            "downgraded" => SubscriptionEventKind::Downgraded,
            "cancellation_scheduled" => SubscriptionEventKind::CancellationScheduled,
            "cancelled" => SubscriptionEventKind::Cancelled,
            "reactivated" => SubscriptionEventKind::Reactivated,
            "paused" => SubscriptionEventKind::Paused,
            "resumed" => SubscriptionEventKind::Resumed,
            "overdue" => SubscriptionEventKind::Overdue,
            "recovered" => SubscriptionEventKind::Recovered,
            "expired" => SubscriptionEventKind::Expired,
            _ => return None,
        };
        Some(kind)
    }
}

/// Append-only ledger entry; payments and audits are derived from these rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub kind: SubscriptionEventKind,
    pub transaction_ref: Option<String>,
    pub amount: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl SubscriptionEvent {
    pub fn new(
        subscription_id: Uuid,
        kind: SubscriptionEventKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            kind,
            transaction_ref: None,
            amount: None,
            occurred_at,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_settlement(mut self, transaction_ref: impl Into<String>, amount: Decimal) -> Self {
        self.transaction_ref = Some(transaction_ref.into());
        self.amount = Some(amount);
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Compliance row capturing a status change and the amounts around it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChangeAudit {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub from_status: SubscriptionStatus,
    pub to_status: SubscriptionStatus,
    pub previous_amount: Decimal,
    pub new_amount: Decimal,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}
