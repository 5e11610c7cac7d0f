use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    ScheduledChanges,
    Redemptions,
    Dunning,
    Reconcile,
}

impl SweepKind {
    /// Order `all` runs in: pending changes land before renewals read the subscription rows.
    pub const ALL: [SweepKind; 4] = [
        SweepKind::ScheduledChanges,
        SweepKind::Redemptions,
        SweepKind::Dunning,
        SweepKind::Reconcile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SweepKind::ScheduledChanges => "scheduled-changes",
            SweepKind::Redemptions => "redemptions",
            SweepKind::Dunning => "dunning",
            SweepKind::Reconcile => "reconcile",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "scheduled-changes" | "changes" => Some(SweepKind::ScheduledChanges),
            "redemptions" | "renewals" => Some(SweepKind::Redemptions),
            "dunning" => Some(SweepKind::Dunning),
            "reconcile" => Some(SweepKind::Reconcile),
            _ => None,
        }
    }

    pub fn channel(&self) -> String {
        format!("billing.sweeps.{}", self.as_str())
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published after every sweep so dashboards and alerting can follow the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepCompletedEvent {
    pub sweep: SweepKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    pub report: serde_json::Value,
    pub error: Option<String>,
}
