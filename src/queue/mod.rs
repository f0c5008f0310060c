mod limiter;

pub use limiter::{TokenBucket, backoff_delay_ms};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::{Wal, WalHandle};

#[derive(Debug)]
pub enum QueueError {
    Validation(&'static str),
    NotFound(Ulid),
    WalError(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Validation(msg) => write!(f, "validation: {msg}"),
            QueueError::NotFound(id) => write!(f, "not found: {id}"),
            QueueError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub gateway_rate_per_min: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: Ms,
    pub backoff_cap_ms: Ms,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            gateway_rate_per_min: DEFAULT_GATEWAY_RATE_PER_MIN,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
        }
    }
}

/// Per-device queue state: at most one current item (Pending or InFlight)
/// plus one follow-up parked behind an in-flight attempt. The last confirmed
/// delivered hash suppresses redundant retransmission.
#[derive(Debug, Default)]
pub struct DeviceSlot {
    pub current: Option<DownlinkItem>,
    pub followup: Option<DownlinkItem>,
    pub last_delivered_hash: Option<u32>,
}

type SharedSlot = Arc<Mutex<DeviceSlot>>;

/// A dead-lettered item, retained for inspection until requeued or purged.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub item: DownlinkItem,
    pub reason: String,
    pub at: Ms,
}

/// A send the dispatcher should perform now. Snapshot taken while marking
/// the item InFlight; the outcome is applied through [`DownlinkQueue::complete`].
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub id: Ulid,
    pub space: Ulid,
    pub device: Ulid,
    pub gateway: Ulid,
    pub payload: Vec<u8>,
    pub fport: u8,
    pub attempts: u32,
}

/// Point-in-time queue health, consumed by the metrics exporter and ops
/// tooling.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
    pub oldest_pending_age_ms: Option<Ms>,
    /// Available tokens per gateway.
    pub gateway_tokens: Vec<(Ulid, f64)>,
}

/// Durable, coalescing downlink queue. Producers call [`enqueue`] and never
/// wait on delivery; the dispatch worker drains due items and reports
/// outcomes. Everything state-changing is journaled, and every transition is
/// applied through the same `apply` used on replay.
///
/// [`enqueue`]: DownlinkQueue::enqueue
pub struct DownlinkQueue {
    slots: DashMap<Ulid, SharedSlot>,
    dead: DashMap<Ulid, DeadLetter>,
    /// Per-gateway buckets behind independent std mutexes — never held
    /// across await, never shared across gateways.
    buckets: DashMap<Ulid, std::sync::Mutex<TokenBucket>>,
    wal: WalHandle<QueueEvent>,
    cfg: QueueConfig,
}

impl DownlinkQueue {
    pub fn open(wal_path: PathBuf, cfg: QueueConfig) -> io::Result<Self> {
        let events = Wal::<QueueEvent>::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?, "queue");

        let queue = Self {
            slots: DashMap::new(),
            dead: DashMap::new(),
            buckets: DashMap::new(),
            wal,
            cfg,
        };

        // Replay — sole owner, try_lock always succeeds.
        for event in &events {
            let device = queue.event_device(event);
            let Some(device) = device else { continue };
            let slot = queue.slot(device);
            let mut guard = slot.try_lock().expect("replay: uncontended lock");
            queue.apply(&mut guard, event);
        }

        // An item in flight at crash has an unknown outcome: retry it.
        for entry in queue.slots.iter() {
            let mut guard = entry.value().try_lock().expect("replay: uncontended lock");
            if let Some(item) = &mut guard.current
                && item.status == DownlinkStatus::InFlight
            {
                item.status = DownlinkStatus::Pending;
            }
        }

        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    fn slot(&self, device: Ulid) -> SharedSlot {
        self.slots
            .entry(device)
            .or_insert_with(|| Arc::new(Mutex::new(DeviceSlot::default())))
            .value()
            .clone()
    }

    /// The device a journal record belongs to. `Requeued`/`Purged` resolve
    /// through the dead-letter map.
    fn event_device(&self, event: &QueueEvent) -> Option<Ulid> {
        match event {
            QueueEvent::Enqueued { item } => Some(item.device),
            QueueEvent::AttemptStarted { device, .. }
            | QueueEvent::Delivered { device, .. }
            | QueueEvent::RetryScheduled { device, .. }
            | QueueEvent::DeadLettered { device, .. } => Some(*device),
            QueueEvent::Requeued { id, .. } => self.dead.get(id).map(|d| d.item.device),
            QueueEvent::Purged { id } => self.dead.get(id).map(|d| d.item.device),
        }
    }

    /// Apply one journal record to a device slot. Used identically by live
    /// mutation paths and by replay, so the on-disk journal and the in-memory
    /// state can never drift.
    fn apply(&self, slot: &mut DeviceSlot, event: &QueueEvent) {
        match event {
            QueueEvent::Enqueued { item } => {
                let in_flight = slot
                    .current
                    .as_ref()
                    .is_some_and(|c| c.status == DownlinkStatus::InFlight);
                if in_flight {
                    // Park behind the in-flight attempt, replacing any older
                    // follow-up.
                    slot.followup = Some(item.clone());
                } else {
                    // Coalesce: only the latest command per device survives.
                    slot.current = Some(item.clone());
                }
            }
            QueueEvent::AttemptStarted { id, .. } => {
                if let Some(cur) = &mut slot.current
                    && cur.id == *id
                {
                    cur.status = DownlinkStatus::InFlight;
                }
            }
            QueueEvent::Delivered { id, hash, .. } => {
                slot.last_delivered_hash = Some(*hash);
                if slot.current.as_ref().is_some_and(|c| c.id == *id) {
                    slot.current = slot.followup.take();
                }
            }
            QueueEvent::RetryScheduled {
                id,
                attempts,
                next_eligible,
                ..
            } => {
                if slot.current.as_ref().is_some_and(|c| c.id == *id) {
                    if slot.followup.is_some() {
                        // A newer command arrived while this one was failing;
                        // the old command is superseded, not retried.
                        slot.current = slot.followup.take();
                    } else if let Some(cur) = &mut slot.current {
                        cur.status = DownlinkStatus::Pending;
                        cur.attempts = *attempts;
                        cur.next_eligible = *next_eligible;
                    }
                }
            }
            QueueEvent::DeadLettered {
                id,
                at,
                attempts,
                reason,
                ..
            } => {
                if let Some(mut item) = slot.current.take_if(|c| c.id == *id) {
                    item.status = DownlinkStatus::DeadLettered;
                    item.attempts = *attempts;
                    self.dead.insert(
                        *id,
                        DeadLetter {
                            item,
                            reason: reason.clone(),
                            at: *at,
                        },
                    );
                    slot.current = slot.followup.take();
                    if self.dead.len() > MAX_DEAD_LETTERS {
                        warn!("dead-letter list over {MAX_DEAD_LETTERS} entries; purge or requeue");
                    }
                }
            }
            QueueEvent::Requeued { id, at } => {
                if let Some((_, dl)) = self.dead.remove(id) {
                    let mut item = dl.item;
                    item.status = DownlinkStatus::Pending;
                    item.attempts = 0;
                    item.next_eligible = *at;
                    if slot.current.is_none() {
                        slot.current = Some(item);
                    } else {
                        // A newer command is already queued for the device;
                        // latest-wins, the requeued item yields to it.
                        warn!("requeue of {id} superseded by a newer queued command");
                    }
                }
            }
            QueueEvent::Purged { id } => {
                self.dead.remove(id);
            }
        }
    }

    async fn journal_and_apply(
        &self,
        slot: &mut DeviceSlot,
        event: QueueEvent,
    ) -> Result<(), QueueError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| QueueError::WalError(e.to_string()))?;
        self.apply(slot, &event);
        Ok(())
    }

    // ── Producer side ────────────────────────────────────────

    /// Fast, non-blocking-on-delivery durable write. Coalesces with any
    /// Pending item for the device; a command whose hash matches the last
    /// confirmed delivery is suppressed when nothing else is queued. Errors
    /// here are journal errors only — delivery failures never surface.
    pub async fn enqueue(&self, cmd: &DisplayCommand, now: Ms) -> Result<(), QueueError> {
        if cmd.payload.len() > MAX_PAYLOAD_LEN {
            return Err(QueueError::Validation("payload too large"));
        }

        let slot = self.slot(cmd.device);
        let mut guard = slot.lock().await;

        if guard.current.is_none()
            && guard.followup.is_none()
            && guard.last_delivered_hash == Some(cmd.hash)
        {
            metrics::counter!(crate::observability::DOWNLINKS_SUPPRESSED_TOTAL).increment(1);
            return Ok(());
        }
        // Identical content already queued — nothing to do.
        let queued_hash = guard
            .followup
            .as_ref()
            .or(guard.current.as_ref())
            .map(|i| i.hash);
        if queued_hash == Some(cmd.hash) {
            metrics::counter!(crate::observability::DOWNLINKS_SUPPRESSED_TOTAL).increment(1);
            return Ok(());
        }

        let coalesced = guard
            .current
            .as_ref()
            .is_some_and(|c| c.status == DownlinkStatus::Pending)
            || guard.followup.is_some();
        let item = DownlinkItem::from_command(Ulid::new(), cmd, now);
        self.journal_and_apply(&mut guard, QueueEvent::Enqueued { item })
            .await?;

        metrics::counter!(crate::observability::DOWNLINKS_ENQUEUED_TOTAL).increment(1);
        if coalesced {
            metrics::counter!(crate::observability::DOWNLINKS_COALESCED_TOTAL).increment(1);
        }
        Ok(())
    }

    // ── Dispatcher side ──────────────────────────────────────

    /// Select Pending items that are due and whose gateway has a token,
    /// marking each InFlight and consuming its token. Two-phase: collect the
    /// slot handles first, then lock each one briefly.
    pub async fn take_due(&self, now: Ms) -> Result<Vec<DispatchJob>, QueueError> {
        let handles: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();

        let mut jobs = Vec::new();
        for slot in handles {
            // A slot busy with a producer is simply picked up next tick.
            let Ok(mut guard) = slot.try_lock() else { continue };
            let Some(cur) = &guard.current else { continue };
            if cur.status != DownlinkStatus::Pending || cur.next_eligible > now {
                continue;
            }
            if !self.take_token(cur.gateway, now) {
                continue;
            }

            let (id, device, at) = (cur.id, cur.device, now);
            self.journal_and_apply(&mut guard, QueueEvent::AttemptStarted { id, device, at })
                .await?;
            if let Some(cur) = &guard.current {
                jobs.push(DispatchJob {
                    id: cur.id,
                    space: cur.space,
                    device: cur.device,
                    gateway: cur.gateway,
                    payload: cur.payload.clone(),
                    fport: cur.fport,
                    attempts: cur.attempts,
                });
            }
        }
        Ok(jobs)
    }

    fn take_token(&self, gateway: Ulid, now: Ms) -> bool {
        let bucket = self.buckets.entry(gateway).or_insert_with(|| {
            std::sync::Mutex::new(TokenBucket::per_minute(self.cfg.gateway_rate_per_min, now))
        });
        let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
        guard.try_take(now)
    }

    /// Apply a send outcome to an in-flight item. Retryable failures back
    /// off exponentially until the attempt cap dead-letters the item; a
    /// permanent failure dead-letters immediately. A follow-up command, if
    /// one arrived meanwhile, supersedes the failed item.
    pub async fn complete(
        &self,
        job: &DispatchJob,
        outcome: crate::gateway::SendOutcome,
        now: Ms,
    ) -> Result<(), QueueError> {
        use crate::gateway::SendOutcome;

        let slot = self.slot(job.device);
        let mut guard = slot.lock().await;
        if !guard.current.as_ref().is_some_and(|c| c.id == job.id) {
            return Ok(()); // stale completion
        }

        let event = match outcome {
            SendOutcome::Delivered => QueueEvent::Delivered {
                id: job.id,
                device: job.device,
                hash: guard.current.as_ref().map(|c| c.hash).unwrap_or_default(),
                at: now,
            },
            SendOutcome::Retryable(reason) => {
                let attempts = job.attempts + 1;
                if attempts >= self.cfg.max_attempts {
                    QueueEvent::DeadLettered {
                        id: job.id,
                        device: job.device,
                        at: now,
                        attempts,
                        reason,
                    }
                } else {
                    QueueEvent::RetryScheduled {
                        id: job.id,
                        device: job.device,
                        attempts,
                        next_eligible: now
                            + backoff_delay_ms(
                                attempts,
                                self.cfg.backoff_base_ms,
                                self.cfg.backoff_cap_ms,
                            ),
                    }
                }
            }
            SendOutcome::Permanent(reason) => QueueEvent::DeadLettered {
                id: job.id,
                device: job.device,
                at: now,
                attempts: job.attempts,
                reason,
            },
        };

        if let QueueEvent::DeadLettered { reason, .. } = &event {
            warn!(device = %job.device, "downlink dead-lettered: {reason}");
            metrics::counter!(crate::observability::DOWNLINKS_DEAD_LETTERED_TOTAL).increment(1);
        }
        self.journal_and_apply(&mut guard, event).await
    }

    // ── Operator surface ─────────────────────────────────────

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut list: Vec<DeadLetter> = self.dead.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|d| d.at);
        list
    }

    /// The only recovery path for a dead letter: back to Pending with the
    /// attempt count reset.
    pub async fn requeue(&self, id: Ulid, now: Ms) -> Result<(), QueueError> {
        let device = self
            .dead
            .get(&id)
            .map(|d| d.item.device)
            .ok_or(QueueError::NotFound(id))?;
        let slot = self.slot(device);
        let mut guard = slot.lock().await;
        self.journal_and_apply(&mut guard, QueueEvent::Requeued { id, at: now })
            .await
    }

    pub async fn purge(&self, id: Ulid) -> Result<(), QueueError> {
        let device = self
            .dead
            .get(&id)
            .map(|d| d.item.device)
            .ok_or(QueueError::NotFound(id))?;
        let slot = self.slot(device);
        let mut guard = slot.lock().await;
        self.journal_and_apply(&mut guard, QueueEvent::Purged { id })
            .await
    }

    /// Queue health for the metrics exporter and ops tooling.
    pub fn metrics_snapshot(&self, now: Ms) -> QueueMetrics {
        let mut pending = 0usize;
        let mut in_flight = 0usize;
        let mut oldest: Option<Ms> = None;

        let handles: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in handles {
            let Ok(guard) = slot.try_lock() else { continue };
            for item in guard.current.iter().chain(guard.followup.iter()) {
                match item.status {
                    DownlinkStatus::Pending => {
                        pending += 1;
                        oldest = Some(oldest.map_or(item.created_at, |o| o.min(item.created_at)));
                    }
                    DownlinkStatus::InFlight => in_flight += 1,
                    _ => {}
                }
            }
        }

        let gateway_tokens = self
            .buckets
            .iter()
            .map(|e| {
                let mut bucket = e.value().lock().unwrap_or_else(|p| p.into_inner());
                (*e.key(), bucket.available(now))
            })
            .collect();

        QueueMetrics {
            pending,
            in_flight,
            dead_letters: self.dead.len(),
            oldest_pending_age_ms: oldest.map(|o| (now - o).max(0)),
            gateway_tokens,
        }
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Rewrite the journal from live state: dead letters first (each as an
    /// enqueue + dead-letter pair so replay routes them through the same
    /// transitions), then per-device delivered-hash and queued items.
    pub async fn compact_wal(&self) -> Result<(), QueueError> {
        let mut events = Vec::new();

        for entry in self.dead.iter() {
            let dl = entry.value();
            let mut item = dl.item.clone();
            item.status = DownlinkStatus::Pending;
            events.push(QueueEvent::Enqueued { item });
            events.push(QueueEvent::DeadLettered {
                id: dl.item.id,
                device: dl.item.device,
                at: dl.at,
                attempts: dl.item.attempts,
                reason: dl.reason.clone(),
            });
        }

        let handles: Vec<(Ulid, SharedSlot)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (device, slot) in handles {
            let guard = slot.lock().await;
            if let Some(hash) = guard.last_delivered_hash {
                events.push(QueueEvent::Delivered {
                    id: Ulid::nil(),
                    device,
                    hash,
                    at: 0,
                });
            }
            // Current before follow-up: a follow-up only exists behind an
            // InFlight current, which replay parks it behind again.
            for item in guard.current.iter().chain(guard.followup.iter()) {
                events.push(QueueEvent::Enqueued { item: item.clone() });
                if item.status == DownlinkStatus::InFlight {
                    events.push(QueueEvent::AttemptStarted {
                        id: item.id,
                        device,
                        at: item.created_at,
                    });
                }
            }
        }

        self.wal
            .compact(events)
            .await
            .map_err(|e| QueueError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
