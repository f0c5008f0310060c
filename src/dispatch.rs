use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error};

use crate::gateway::{GatewaySend, SendOutcome};
use crate::model::now_ms;
use crate::queue::DownlinkQueue;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub tick: Duration,
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// The dispatch worker: every tick, drain due items and fan the sends out
/// concurrently. The only blocking waits in the whole pipeline live here —
/// on the tick and on the timeout-bounded send call.
pub async fn run_dispatcher<S: GatewaySend + ?Sized>(
    queue: Arc<DownlinkQueue>,
    sender: Arc<S>,
    cfg: DispatchConfig,
) {
    let mut interval = tokio::time::interval(cfg.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        dispatch_once(&queue, sender.as_ref(), cfg.send_timeout).await;
        publish_gauges(&queue);
    }
}

/// One dispatcher pass, separated from the loop so tests can drive ticks
/// without sleeping. Returns the number of attempts made.
pub async fn dispatch_once<S: GatewaySend + ?Sized>(
    queue: &DownlinkQueue,
    sender: &S,
    send_timeout: Duration,
) -> usize {
    let jobs = match queue.take_due(now_ms()).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("dispatch pass failed to select due items: {e}");
            return 0;
        }
    };
    if jobs.is_empty() {
        return 0;
    }
    debug!("dispatching {} downlink(s)", jobs.len());

    let attempts = jobs.len();
    join_all(jobs.into_iter().map(|job| async move {
        let started = std::time::Instant::now();
        let outcome = match tokio::time::timeout(
            send_timeout,
            sender.send(job.device, job.gateway, &job.payload, job.fport),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::Retryable("send timeout".into()),
        };

        metrics::histogram!(crate::observability::SEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::DISPATCH_ATTEMPTS_TOTAL,
            "outcome" => outcome_label(&outcome)
        )
        .increment(1);

        if let Err(e) = queue.complete(&job, outcome, now_ms()).await {
            error!(device = %job.device, "failed to record send outcome: {e}");
        }
    }))
    .await;

    attempts
}

fn outcome_label(outcome: &SendOutcome) -> &'static str {
    match outcome {
        SendOutcome::Delivered => "delivered",
        SendOutcome::Retryable(_) => "retryable",
        SendOutcome::Permanent(_) => "permanent",
    }
}

fn publish_gauges(queue: &DownlinkQueue) {
    let snap = queue.metrics_snapshot(now_ms());
    metrics::gauge!(crate::observability::QUEUE_PENDING).set(snap.pending as f64);
    metrics::gauge!(crate::observability::QUEUE_IN_FLIGHT).set(snap.in_flight as f64);
    metrics::gauge!(crate::observability::QUEUE_DEAD_LETTERS).set(snap.dead_letters as f64);
    metrics::gauge!(crate::observability::QUEUE_OLDEST_PENDING_AGE_SECONDS)
        .set(snap.oldest_pending_age_ms.unwrap_or(0) as f64 / 1000.0);
    for (gateway, tokens) in snap.gateway_tokens {
        metrics::gauge!(
            crate::observability::GATEWAY_TOKENS_AVAILABLE,
            "gateway" => gateway.to_string()
        )
        .set(tokens);
    }
}

/// Compact the queue journal whenever enough appends accumulate.
pub async fn run_queue_compactor(queue: Arc<DownlinkQueue>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if queue.wal_appends_since_compact().await >= threshold {
            match queue.compact_wal().await {
                Ok(()) => debug!("queue journal compacted"),
                Err(e) => error!("queue journal compaction failed: {e}"),
            }
        }
    }
}
