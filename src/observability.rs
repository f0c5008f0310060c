use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "placard_reservations_created_total";

/// Counter: booking attempts rejected with a conflict.
pub const RESERVATIONS_CONFLICTED_TOTAL: &str = "placard_reservations_conflicted_total";

/// Counter: state-engine recomputes. Labels: cause.
pub const RECOMPUTES_TOTAL: &str = "placard_recomputes_total";

/// Counter: dispatch attempts. Labels: outcome.
pub const DISPATCH_ATTEMPTS_TOTAL: &str = "placard_dispatch_attempts_total";

/// Histogram: gateway send latency in seconds.
pub const SEND_DURATION_SECONDS: &str = "placard_send_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: queue depth (Pending items).
pub const QUEUE_PENDING: &str = "placard_queue_pending";

/// Gauge: items currently in flight.
pub const QUEUE_IN_FLIGHT: &str = "placard_queue_in_flight";

/// Gauge: dead-letter depth.
pub const QUEUE_DEAD_LETTERS: &str = "placard_queue_dead_letters";

/// Gauge: age of the oldest Pending item in seconds.
pub const QUEUE_OLDEST_PENDING_AGE_SECONDS: &str = "placard_queue_oldest_pending_age_seconds";

/// Gauge: available tokens. Labels: gateway.
pub const GATEWAY_TOKENS_AVAILABLE: &str = "placard_gateway_tokens_available";

/// Counter: downlinks accepted by the queue.
pub const DOWNLINKS_ENQUEUED_TOTAL: &str = "placard_downlinks_enqueued_total";

/// Counter: downlinks coalesced away before dispatch.
pub const DOWNLINKS_COALESCED_TOTAL: &str = "placard_downlinks_coalesced_total";

/// Counter: downlinks suppressed as already delivered or already queued.
pub const DOWNLINKS_SUPPRESSED_TOTAL: &str = "placard_downlinks_suppressed_total";

/// Counter: downlinks moved to the dead-letter list.
pub const DOWNLINKS_DEAD_LETTERED_TOTAL: &str = "placard_downlinks_dead_lettered_total";

/// Gauge: number of active tenants (loaded ledgers).
pub const TENANTS_ACTIVE: &str = "placard_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds. Labels: journal.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "placard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush). Labels: journal.
pub const WAL_FLUSH_BATCH_SIZE: &str = "placard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
