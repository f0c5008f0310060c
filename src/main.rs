use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use placard::actuate::{Actuator, run_actuator};
use placard::dispatch::{DispatchConfig, run_dispatcher, run_queue_compactor};
use placard::gateway::LogSender;
use placard::policy::StaticPolicyStore;
use placard::queue::{DownlinkQueue, QueueConfig};
use placard::tenant::TenantManager;
use placard::trigger::TriggerHub;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = env_parse("PLACARD_METRICS_PORT");
    placard::observability::init(metrics_port);

    let data_dir = std::env::var("PLACARD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = env_parse("PLACARD_COMPACT_THRESHOLD").unwrap_or(1000);
    let retention_ms: i64 = env_parse("PLACARD_RETENTION_MS").unwrap_or(604_800_000); // 7 days

    let queue_cfg = QueueConfig {
        gateway_rate_per_min: env_parse("PLACARD_GATEWAY_RATE_PER_MIN")
            .unwrap_or(placard::limits::DEFAULT_GATEWAY_RATE_PER_MIN),
        max_attempts: env_parse("PLACARD_MAX_ATTEMPTS")
            .unwrap_or(placard::limits::DEFAULT_MAX_ATTEMPTS),
        backoff_base_ms: env_parse("PLACARD_BACKOFF_BASE_MS")
            .unwrap_or(placard::limits::DEFAULT_BACKOFF_BASE_MS),
        backoff_cap_ms: env_parse("PLACARD_BACKOFF_CAP_MS")
            .unwrap_or(placard::limits::DEFAULT_BACKOFF_CAP_MS),
    };
    let dispatch_cfg = DispatchConfig {
        tick: Duration::from_millis(env_parse("PLACARD_DISPATCH_TICK_MS").unwrap_or(500)),
        send_timeout: Duration::from_millis(env_parse("PLACARD_SEND_TIMEOUT_MS").unwrap_or(10_000)),
    };

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let policies = Arc::new(match std::env::var("PLACARD_POLICY_FILE") {
        Ok(path) => StaticPolicyStore::load(&PathBuf::from(path))?,
        Err(_) => StaticPolicyStore::default(),
    });

    let triggers = Arc::new(TriggerHub::new());
    let tenants = Arc::new(TenantManager::new(
        PathBuf::from(&data_dir),
        triggers.clone(),
        compact_threshold,
        retention_ms,
    ));
    let queue = Arc::new(DownlinkQueue::open(
        PathBuf::from(&data_dir).join("queue.wal"),
        queue_cfg,
    )?);

    let actuator = Arc::new(Actuator::new(tenants, queue.clone(), policies));
    tokio::spawn(run_actuator(actuator, triggers.subscribe()));

    // No network-server client configured means dry-run delivery.
    let sender = Arc::new(LogSender);
    tokio::spawn(run_dispatcher(queue.clone(), sender, dispatch_cfg.clone()));
    tokio::spawn(run_queue_compactor(queue.clone(), compact_threshold));

    info!(
        "placard up: data_dir={data_dir}, dispatch tick {:?}, send timeout {:?}",
        dispatch_cfg.tick, dispatch_cfg.send_timeout
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
