use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chainbill_dunning::{ActionRegistry, DunningEngine};
use chainbill_platform::{
    HttpExecutionService, RedisBus, RedisNotificationSender, ServiceConfig, SweepCompletedEvent,
    SweepKind, connect_record_store,
};
use chainbill_scheduler::{RedemptionSweep, ScheduledChangeProcessor};
use chainbill_settlement::SettlementExecutor;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

const USAGE: &str = "usage: chainbill-ops [scheduled-changes|redemptions|dunning|reconcile|all]...";

struct Worker {
    executor: Arc<SettlementExecutor>,
    dunning: Arc<DunningEngine>,
    batch_size: usize,
    redemption_lease: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chainbill_ops=info".to_string()),
        )
        .init();

    let sweeps = parse_sweeps(std::env::args().skip(1))?;
    let config = ServiceConfig::from_env()?;
    let settings = config.engine_settings();

    let store = Arc::new(connect_record_store(&config.database_url).await?);
    let redis = RedisBus::connect(&config.redis_url)?;
    let execution = Arc::new(HttpExecutionService::new(&config.execution_service_url));
    let notifier = Arc::new(RedisNotificationSender::new(
        redis.clone(),
        config.notification_channel.clone(),
    ));

    let executor = Arc::new(SettlementExecutor::new(store.clone(), execution, &settings));
    let registry =
        ActionRegistry::standard(executor.clone(), notifier, settings.notification_timeout);
    let worker = Worker {
        dunning: Arc::new(DunningEngine::new(store, registry, &settings)),
        executor,
        batch_size: settings.batch_size,
        redemption_lease: settings.redemption_lease,
    };

    let mut failed = Vec::new();
    for sweep in sweeps {
        let started_at = Utc::now();
        info!("starting {sweep} sweep");
        let result = worker.run(sweep).await;

        let event = SweepCompletedEvent {
            sweep,
            started_at,
            finished_at: Utc::now(),
            succeeded: result.is_ok(),
            report: result.as_ref().ok().cloned().unwrap_or_default(),
            error: result.as_ref().err().map(|err| format!("{err:#}")),
        };
        if let Err(err) = redis.publish_json(&sweep.channel(), &event).await {
            warn!("failed to publish {sweep} sweep report: {err:#}");
        }

        if let Err(err) = result {
            error!("{sweep} sweep failed: {err:#}");
            failed.push(sweep);
        }
    }

    if !failed.is_empty() {
        let names: Vec<&str> = failed.iter().map(SweepKind::as_str).collect();
        anyhow::bail!("sweeps failed: {}", names.join(", "));
    }
    Ok(())
}

impl Worker {
    async fn run(&self, sweep: SweepKind) -> Result<serde_json::Value> {
        let now = Utc::now();
        match sweep {
            SweepKind::ScheduledChanges => {
                let processor =
                    ScheduledChangeProcessor::new(self.executor.clone(), self.batch_size)
                        .with_failure_handler(self.dunning.clone())
                        .with_lease(self.redemption_lease);
                report(processor.run_sweep(now).await?)
            }
            SweepKind::Redemptions => {
                let renewals = RedemptionSweep::new(self.executor.clone(), self.batch_size)
                    .with_failure_handler(self.dunning.clone())
                    .with_lease(self.redemption_lease);
                report(renewals.run_sweep(now).await?)
            }
            SweepKind::Dunning => report(self.dunning.run_sweep(now).await?),
            SweepKind::Reconcile => report(self.executor.reconcile(now).await?),
        }
    }
}

fn report<T: Serialize>(report: T) -> Result<serde_json::Value> {
    serde_json::to_value(report).context("failed to serialize sweep report")
}

/// No arguments, or `all`, runs every sweep in dependency order.
fn parse_sweeps(args: impl IntoIterator<Item = String>) -> Result<Vec<SweepKind>> {
    let mut sweeps = Vec::new();
    for arg in args {
        if arg.eq_ignore_ascii_case("all") {
            return Ok(SweepKind::ALL.to_vec());
        }
        let sweep = SweepKind::parse(&arg)
            .with_context(|| format!("unknown sweep {arg:?}\n{USAGE}"))?;
        if !sweeps.contains(&sweep) {
            sweeps.push(sweep);
        }
    }

    if sweeps.is_empty() {
        return Ok(SweepKind::ALL.to_vec());
    }
    sweeps.sort_by_key(|sweep| SweepKind::ALL.iter().position(|known| known == sweep));
    Ok(sweeps)
}
