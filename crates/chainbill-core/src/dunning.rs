use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Longest wait a policy may configure between two attempts.
pub const MAX_RETRY_INTERVAL_DAYS: i64 = 3650;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DunningAction {
    RetryPayment,
    Email,
    InApp,
}

impl DunningAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningAction::RetryPayment => "retry_payment",
            DunningAction::Email => "email",
            DunningAction::InApp => "in_app",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retry_payment" => Some(DunningAction::RetryPayment),
            "email" => Some(DunningAction::Email),
            "in_app" => Some(DunningAction::InApp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalAction {
    MarkFailed,
    Cancel,
}

/// Per-workspace recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DunningConfiguration {
    pub workspace_id: Uuid,
    pub max_attempts: u32,
    /// Wait before each attempt, in days. Index 0 is the wait between failure and attempt 1.
    pub retry_interval_days: Vec<i64>,
    #[serde(default)]
    pub attempt_actions: BTreeMap<u32, Vec<DunningAction>>,
    pub final_action: FinalAction,
}

impl DunningConfiguration {
    /// Decodes a stored configuration and rejects policies the engine cannot run.
    pub fn from_json(value: serde_json::Value) -> BillingResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|err| BillingError::Configuration(format!("malformed dunning configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.max_attempts == 0 {
            return Err(BillingError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(days) = self
            .retry_interval_days
            .iter()
            .find(|days| !(0..=MAX_RETRY_INTERVAL_DAYS).contains(*days))
        {
            return Err(BillingError::Configuration(format!(
                "retry interval of {days} days outside 0..={MAX_RETRY_INTERVAL_DAYS}"
            )));
        }
        if self.retry_interval_days.len() < self.max_attempts as usize {
            return Err(BillingError::Configuration(format!(
                "{} retry intervals configured for {} attempts",
                self.retry_interval_days.len(),
                self.max_attempts
            )));
        }
        if let Some(attempt) = self
            .attempt_actions
            .keys()
            .find(|attempt| **attempt == 0 || **attempt > self.max_attempts)
        {
            return Err(BillingError::Configuration(format!(
                "actions configured for attempt {attempt} outside 1..={}",
                self.max_attempts
            )));
        }
        if self.attempt_actions.values().any(Vec::is_empty) {
            return Err(BillingError::Configuration(
                "an attempt must list at least one action".to_string(),
            ));
        }

        Ok(())
    }

    /// Actions for a 1-based attempt number; retrying the payment when none are configured.
    pub fn actions_for(&self, attempt_number: u32) -> Vec<DunningAction> {
        self.attempt_actions
            .get(&attempt_number)
            .cloned()
            .unwrap_or_else(|| vec![DunningAction::RetryPayment])
    }

    /// Wait configured at `index`, or `None` once the list is exhausted.
    pub fn interval_at(&self, index: usize) -> Option<Duration> {
        self.retry_interval_days
            .get(index)
            .and_then(|days| Duration::try_days(*days))
    }

    /// When the retry waiting on interval `index` is due, counted from `from`. Once the list is
    /// exhausted the retry is due at `from`.
    pub fn retry_after(&self, index: usize, from: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        let Some(days) = self.retry_interval_days.get(index) else {
            return Ok(from);
        };
        Duration::try_days(*days)
            .and_then(|wait| from.checked_add_signed(wait))
            .ok_or_else(|| {
                BillingError::Configuration(format!(
                    "retry interval of {days} days from {from} is out of range"
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CampaignTarget {
    Subscription { subscription_id: Uuid },
    OneTimePayment { failure_id: Uuid },
}

impl CampaignTarget {
    pub fn subscription_id(&self) -> Option<Uuid> {
        match self {
            CampaignTarget::Subscription { subscription_id } => Some(*subscription_id),
            CampaignTarget::OneTimePayment { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Recovered,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Recovered => "recovered",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(CampaignStatus::Active),
            "recovered" => Some(CampaignStatus::Recovered),
            "failed" => Some(CampaignStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DunningCampaign {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    pub target: CampaignTarget,
    pub original_amount: Decimal,
    pub currency: String,
    pub current_attempt: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "succeeded" => Some(AttemptStatus::Succeeded),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DunningAttempt {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub attempt_number: u32,
    pub action: DunningAction,
    pub status: AttemptStatus,
    pub detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn config(max_attempts: u32, intervals: Vec<i64>) -> DunningConfiguration {
        DunningConfiguration {
            workspace_id: Uuid::new_v4(),
            max_attempts,
            retry_interval_days: intervals,
            attempt_actions: BTreeMap::new(),
            final_action: FinalAction::MarkFailed,
        }
    }

    #[rstest]
    fn decodes_stored_configuration() {
        let workspace_id = Uuid::new_v4();
        let config = DunningConfiguration::from_json(json!({
            "workspace_id": workspace_id,
            "max_attempts": 3,
            "retry_interval_days": [3, 7, 14],
            "attempt_actions": { "1": ["retry_payment", "email"], "3": ["in_app"] },
            "final_action": "cancel"
        }))
        .unwrap();

        assert_eq!(config.final_action, FinalAction::Cancel);
        assert_eq!(
            config.actions_for(1),
            vec![DunningAction::RetryPayment, DunningAction::Email]
        );
        assert_eq!(config.actions_for(2), vec![DunningAction::RetryPayment]);
        assert_eq!(config.actions_for(3), vec![DunningAction::InApp]);
    }

    #[rstest]
    #[case(config(0, vec![]))]
    #[case(config(3, vec![3, 7]))]
    #[case(config(2, vec![3, -1]))]
    #[case(config(1, vec![MAX_RETRY_INTERVAL_DAYS + 1]))]
    #[case(config(1, vec![i64::MAX]))]
    fn rejects_unrunnable_policies(#[case] config: DunningConfiguration) {
        assert!(matches!(
            config.validate(),
            Err(BillingError::Configuration(_))
        ));
    }

    #[rstest]
    fn rejects_actions_outside_attempt_range() {
        let mut config = config(2, vec![1, 1]);
        config
            .attempt_actions
            .insert(3, vec![DunningAction::Email]);
        assert!(config.validate().is_err());
    }

    #[rstest]
    fn oversized_interval_is_rejected_at_load() {
        let loaded = DunningConfiguration::from_json(json!({
            "workspace_id": Uuid::new_v4(),
            "max_attempts": 1,
            "retry_interval_days": [i64::MAX],
            "final_action": "mark_failed"
        }));

        assert!(matches!(loaded, Err(BillingError::Configuration(_))));
    }

    #[rstest]
    fn retry_time_overflow_is_a_configuration_error() {
        let config = config(1, vec![i64::MAX]);
        let now = Utc::now();

        assert_eq!(config.interval_at(0), None);
        assert!(matches!(
            config.retry_after(0, now),
            Err(BillingError::Configuration(_))
        ));
        assert!(config.retry_after(0, DateTime::<Utc>::MAX_UTC).is_err());
        assert_eq!(config.retry_after(1, now).unwrap(), now);
    }

    #[rstest]
    fn interval_lookup_stops_at_end_of_list() {
        let config = config(3, vec![3, 7, 14]);
        assert_eq!(config.interval_at(1), Some(Duration::days(7)));
        assert_eq!(config.interval_at(3), None);
    }
}
