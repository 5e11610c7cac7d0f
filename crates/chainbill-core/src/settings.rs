use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by the sweeps and the settlement executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub execution_timeout: Duration,
    pub notification_timeout: Duration,
    pub batch_size: usize,
    pub dunning_concurrency: usize,
    /// How long a sweep holds a due redemption before another sweep may take it over.
    pub redemption_lease: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            notification_timeout: Duration::from_secs(10),
            batch_size: 100,
            dunning_concurrency: 8,
            redemption_lease: Duration::from_secs(300),
        }
    }
}
