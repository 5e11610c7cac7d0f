use std::time::Duration;

use anyhow::{Context, Result};
use chainbill_core::EngineSettings;

const DEFAULT_NOTIFICATION_CHANNEL: &str = "billing.notifications";

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub execution_service_url: String,
    pub execution_timeout: Duration,
    pub notification_timeout: Duration,
    pub batch_size: usize,
    pub dunning_concurrency: usize,
    pub redemption_lease: Duration,
    /// Redis channel the email and in-app delivery service listens on.
    pub notification_channel: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| lookup(key).with_context(|| format!("{key} is required"));
        let defaults = EngineSettings::default();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            execution_service_url: required("EXECUTION_SERVICE_URL")?,
            execution_timeout: seconds(&lookup, "EXECUTION_TIMEOUT_SECS")?
                .unwrap_or(defaults.execution_timeout),
            notification_timeout: seconds(&lookup, "NOTIFICATION_TIMEOUT_SECS")?
                .unwrap_or(defaults.notification_timeout),
            batch_size: count(&lookup, "SWEEP_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            dunning_concurrency: count(&lookup, "DUNNING_CONCURRENCY")?
                .unwrap_or(defaults.dunning_concurrency),
            redemption_lease: seconds(&lookup, "REDEMPTION_LEASE_SECS")?
                .unwrap_or(defaults.redemption_lease),
            notification_channel: lookup("NOTIFICATION_CHANNEL")
                .unwrap_or_else(|| DEFAULT_NOTIFICATION_CHANNEL.to_string()),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            execution_timeout: self.execution_timeout,
            notification_timeout: self.notification_timeout,
            batch_size: self.batch_size,
            dunning_concurrency: self.dunning_concurrency,
            redemption_lease: self.redemption_lease,
        }
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
    Ok(Some(Duration::from_secs(secs)))
}

fn count(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<usize>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a positive integer, got {raw:?}"))?;
    if value == 0 {
        anyhow::bail!("{key} must be at least 1");
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "postgres://localhost/chainbill"),
            ("REDIS_URL", "redis://localhost"),
            ("EXECUTION_SERVICE_URL", "http://execution:8080"),
        ]
    }

    #[rstest]
    fn optional_settings_fall_back_to_engine_defaults() {
        let vars = env(&base());

        let config = ServiceConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let settings = config.engine_settings();
        let defaults = EngineSettings::default();
        assert_eq!(settings.execution_timeout, defaults.execution_timeout);
        assert_eq!(settings.batch_size, defaults.batch_size);
        assert_eq!(settings.redemption_lease, defaults.redemption_lease);
        assert_eq!(config.notification_channel, "billing.notifications");
    }

    #[rstest]
    fn overrides_are_parsed() {
        let mut pairs = base();
        pairs.extend([
            ("EXECUTION_TIMEOUT_SECS", "5"),
            ("SWEEP_BATCH_SIZE", " 25 "),
            ("DUNNING_CONCURRENCY", "2"),
            ("REDEMPTION_LEASE_SECS", "90"),
            ("NOTIFICATION_CHANNEL", "ops.notify"),
        ]);
        let vars = env(&pairs);

        let config = ServiceConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.execution_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.engine_settings().dunning_concurrency, 2);
        assert_eq!(config.engine_settings().redemption_lease, Duration::from_secs(90));
        assert_eq!(config.notification_channel, "ops.notify");
    }

    #[rstest]
    #[case("DATABASE_URL")]
    #[case("REDIS_URL")]
    #[case("EXECUTION_SERVICE_URL")]
    fn required_variables_are_reported(#[case] missing: &str) {
        let pairs: Vec<_> = base().into_iter().filter(|(key, _)| *key != missing).collect();
        let vars = env(&pairs);

        let err = ServiceConfig::from_lookup(|key| vars.get(key).cloned()).unwrap_err();

        assert_eq!(err.to_string(), format!("{missing} is required"));
    }

    #[rstest]
    #[case("SWEEP_BATCH_SIZE", "0")]
    #[case("DUNNING_CONCURRENCY", "many")]
    #[case("EXECUTION_TIMEOUT_SECS", "-3")]
    fn malformed_numbers_are_rejected(#[case] key: &'static str, #[case] value: &'static str) {
        let mut pairs = base();
        pairs.push((key, value));
        let vars = env(&pairs);

        assert!(ServiceConfig::from_lookup(|key| vars.get(key).cloned()).is_err());
    }
}
