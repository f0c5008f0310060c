use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::ledger::Ledger;
use crate::model::now_ms;
use crate::trigger::TriggerCause;

/// Background task that fires recomputes when display-relevant state crosses
/// a time boundary with no external event: an admin override expires, or an
/// active reservation starts or ends. Without it a display would show
/// RESERVED forever after the booking lapses.
pub async fn run_reaper(ledger: Arc<Ledger>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    let mut prev = now_ms();
    loop {
        interval.tick().await;
        let now = now_ms();
        for (space_id, cause) in ledger.collect_due_transitions(prev, now) {
            match cause {
                TriggerCause::OverrideExpired => {
                    match ledger.clear_override(space_id, cause).await {
                        Ok(()) => info!("cleared expired override on space {space_id}"),
                        Err(e) => {
                            // May already have been cleared — that's fine
                            debug!("reaper skip {space_id}: {e}");
                        }
                    }
                }
                _ => ledger.trigger_recompute(space_id, cause),
            }
        }
        prev = now;
    }
}

/// Compact the tenant's journal whenever enough appends accumulate.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64, retention_ms: i64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if ledger.wal_appends_since_compact().await >= threshold {
            match ledger.compact_wal(now_ms(), retention_ms).await {
                Ok(()) => debug!("ledger journal compacted for tenant {}", ledger.tenant()),
                Err(e) => error!("ledger journal compaction failed: {e}"),
            }
        }
    }
}
