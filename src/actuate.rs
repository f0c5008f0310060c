use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::display;
use crate::ledger::LedgerError;
use crate::model::*;
use crate::policy::PolicyStore;
use crate::queue::{DownlinkQueue, QueueError};
use crate::tenant::TenantManager;
use crate::trigger::Trigger;

#[derive(Debug)]
pub enum ActuateError {
    Ledger(LedgerError),
    Queue(QueueError),
    Tenant(String),
}

impl std::fmt::Display for ActuateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuateError::Ledger(e) => write!(f, "ledger: {e}"),
            ActuateError::Queue(e) => write!(f, "queue: {e}"),
            ActuateError::Tenant(e) => write!(f, "tenant: {e}"),
        }
    }
}

impl std::error::Error for ActuateError {}

impl From<LedgerError> for ActuateError {
    fn from(e: LedgerError) -> Self {
        ActuateError::Ledger(e)
    }
}

impl From<QueueError> for ActuateError {
    fn from(e: QueueError) -> Self {
        ActuateError::Queue(e)
    }
}

/// Glue between the ledger, the state engine, and the downlink queue: reads
/// one space's state, computes its display command, enqueues it. Holds no
/// state of its own.
pub struct Actuator {
    tenants: Arc<TenantManager>,
    queue: Arc<DownlinkQueue>,
    policies: Arc<dyn PolicyStore>,
}

impl Actuator {
    pub fn new(
        tenants: Arc<TenantManager>,
        queue: Arc<DownlinkQueue>,
        policies: Arc<dyn PolicyStore>,
    ) -> Self {
        Self {
            tenants,
            queue,
            policies,
        }
    }

    /// Tenant ledger handle, as the intake and ops glue resolves it.
    pub fn ledger(&self, tenant: &str) -> Result<Arc<crate::ledger::Ledger>, ActuateError> {
        self.tenants
            .get_or_create(tenant)
            .map_err(|e| ActuateError::Tenant(e.to_string()))
    }

    /// Recompute a space's display command and hand it to the queue. Returns
    /// the command, or None for an unknown or disabled space.
    pub async fn recompute(
        &self,
        tenant: &str,
        space: Ulid,
    ) -> Result<Option<DisplayCommand>, ActuateError> {
        let ledger = self.ledger(tenant)?;
        let now = now_ms();
        let Some(inputs) = ledger.display_inputs(space, now).await else {
            return Ok(None);
        };
        if !inputs.meta.enabled {
            debug!(%space, "recompute skipped: space disabled");
            return Ok(None);
        }

        let policy = self.policies.policy_for(tenant);
        let cmd = display::compute(
            &inputs.meta,
            &policy,
            inputs.snapshot.as_ref(),
            inputs.reservation.as_ref(),
            inputs.admin_override.as_ref(),
            now,
        );
        self.queue.enqueue(&cmd, now).await?;
        Ok(Some(cmd))
    }

    /// Normalized uplink intake. Records the reading; the resulting trigger
    /// drives the recompute. Returns false for a stale/duplicate frame.
    pub async fn handle_uplink(
        &self,
        tenant: &str,
        space: Ulid,
        state: OccupancyState,
        at: Ms,
        device: Ulid,
        frame_seq: u32,
    ) -> Result<bool, ActuateError> {
        let ledger = self.ledger(tenant)?;
        Ok(ledger
            .record_occupancy(space, state, at, device, frame_seq)
            .await?)
    }

    /// Manual actuation: re-run the computation with no new trigger event.
    pub async fn force_recompute(
        &self,
        tenant: &str,
        space: Ulid,
    ) -> Result<Option<DisplayCommand>, ActuateError> {
        self.recompute(tenant, space).await
    }

    /// Pin a display. Expiry comes from the tenant's policy unless the
    /// caller supplies one.
    pub async fn set_override(
        &self,
        tenant: &str,
        space: Ulid,
        state: OverrideState,
        expires_at: Option<Ms>,
    ) -> Result<(), ActuateError> {
        let ledger = self.ledger(tenant)?;
        let now = now_ms();
        let expires_at = expires_at.or_else(|| {
            self.policies
                .policy_for(tenant)
                .override_expiry_ms
                .map(|d| now + d)
        });
        Ok(ledger.set_override(space, state, now, expires_at).await?)
    }

    pub async fn clear_override(&self, tenant: &str, space: Ulid) -> Result<(), ActuateError> {
        let ledger = self.ledger(tenant)?;
        Ok(ledger
            .clear_override(space, crate::trigger::TriggerCause::OverrideCleared)
            .await?)
    }
}

/// Drain the trigger stream, recomputing one space per trigger. Producers
/// never wait on this task; a lagged receiver only costs redundant
/// recomputes, which the queue coalesces away.
pub async fn run_actuator(actuator: Arc<Actuator>, mut rx: broadcast::Receiver<Trigger>) {
    loop {
        match rx.recv().await {
            Ok(trigger) => {
                metrics::counter!(
                    crate::observability::RECOMPUTES_TOTAL,
                    "cause" => trigger.cause.label()
                )
                .increment(1);
                if let Err(e) = actuator.recompute(&trigger.tenant, trigger.space).await {
                    error!(space = %trigger.space, "recompute failed: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("actuator lagged; {n} trigger(s) dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
