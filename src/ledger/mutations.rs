use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::trigger::TriggerCause;

use super::conflict::{check_no_overlap, validate_request_id, validate_reservation_span};
use super::{Ledger, LedgerError};

impl Ledger {
    // ── Space registry ───────────────────────────────────────

    pub async fn register_space(&self, meta: SpaceMeta) -> Result<(), LedgerError> {
        if self.state.len() >= MAX_SPACES_PER_TENANT {
            return Err(LedgerError::LimitExceeded("too many spaces"));
        }
        if let Some(ref n) = meta.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(LedgerError::LimitExceeded("space name too long"));
        }
        if self.state.contains_key(&meta.id) {
            return Err(LedgerError::AlreadyExists(meta.id));
        }

        let event = LedgerEvent::SpaceRegistered {
            id: meta.id,
            name: meta.name.clone(),
            sensor_dev: meta.sensor_dev,
            display_dev: meta.display_dev,
            gateway: meta.gateway,
            enabled: meta.enabled,
        };
        self.wal_append(&event).await?;
        let id = meta.id;
        self.state
            .insert(id, Arc::new(RwLock::new(SpaceState::new(meta))));
        self.trigger_recompute(id, TriggerCause::SpaceChanged);
        Ok(())
    }

    pub async fn update_space(&self, meta: SpaceMeta) -> Result<(), LedgerError> {
        if let Some(ref n) = meta.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(LedgerError::LimitExceeded("space name too long"));
        }
        let ss = self
            .get_space(&meta.id)
            .ok_or(LedgerError::NotFound(meta.id))?;
        let mut guard = ss.write().await;

        let event = LedgerEvent::SpaceUpdated {
            id: meta.id,
            name: meta.name,
            sensor_dev: meta.sensor_dev,
            display_dev: meta.display_dev,
            gateway: meta.gateway,
            enabled: meta.enabled,
        };
        self.persist_and_apply(meta.id, &mut guard, &event, Some(TriggerCause::SpaceChanged))
            .await
    }

    pub async fn remove_space(&self, id: Ulid) -> Result<(), LedgerError> {
        let ss = self.get_space(&id).ok_or(LedgerError::NotFound(id))?;
        let guard = ss.write().await;

        let event = LedgerEvent::SpaceRemoved { id };
        self.wal_append(&event).await?;
        for r in &guard.reservations {
            self.request_index.remove(&r.request_id);
            self.reservation_to_space.remove(&r.id);
        }
        drop(guard);
        self.state.remove(&id);
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    /// Create a reservation on a space. Returns the existing record when the
    /// request id was seen before (idempotent retry); `Conflict` when an
    /// Active reservation overlaps. The per-space write lock serializes the
    /// check-and-insert, so two concurrent overlapping creates resolve to
    /// exactly one success.
    pub async fn create_reservation(
        &self,
        space_id: Ulid,
        span: Span,
        request_id: &str,
        now: Ms,
    ) -> Result<Reservation, LedgerError> {
        validate_reservation_span(&span)?;
        validate_request_id(request_id)?;

        // Fast path: known request id, no lock needed.
        if let Some(existing) = self.find_by_request_id(request_id) {
            return Ok(existing);
        }

        let ss = self
            .get_space(&space_id)
            .ok_or(LedgerError::NotFound(space_id))?;
        let mut guard = ss.write().await;

        // Re-check under the lock: a concurrent retry of the same request
        // may have won the race between the fast path and here.
        if let Some(id) = self.request_index.get(request_id).map(|e| *e.value())
            && let Some(existing) = guard.get_reservation(&id)
        {
            return Ok(existing.clone());
        }

        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
            return Err(LedgerError::LimitExceeded("too many reservations on space"));
        }

        if let Err(e) = check_no_overlap(&guard, &span) {
            metrics::counter!(crate::observability::RESERVATIONS_CONFLICTED_TOTAL).increment(1);
            return Err(e);
        }

        let id = Ulid::new();
        let event = LedgerEvent::ReservationCreated {
            id,
            space_id,
            span,
            request_id: request_id.to_string(),
            created_at: now,
        };
        self.persist_and_apply(
            space_id,
            &mut guard,
            &event,
            Some(TriggerCause::ReservationCreated),
        )
        .await?;

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        Ok(guard
            .get_reservation(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))?)
    }

    /// Active → Cancelled. Cancelling an already-cancelled reservation is an
    /// idempotent no-op returning the current record.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, LedgerError> {
        let (space_id, mut guard) = self.resolve_reservation_write(&id).await?;

        let current = guard
            .get_reservation(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))?;
        if current.status == ReservationStatus::Cancelled {
            return Ok(current);
        }

        let event = LedgerEvent::ReservationCancelled { id, space_id };
        self.persist_and_apply(
            space_id,
            &mut guard,
            &event,
            Some(TriggerCause::ReservationCancelled),
        )
        .await?;

        Ok(guard
            .get_reservation(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))?)
    }

    // ── Occupancy intake ─────────────────────────────────────

    /// Record a normalized sensor reading. Returns false (and writes nothing)
    /// for a duplicate or out-of-order frame from the assigned sensor; errors
    /// on readings from a device that is not the assigned sensor.
    pub async fn record_occupancy(
        &self,
        space_id: Ulid,
        state: OccupancyState,
        at: Ms,
        device: Ulid,
        frame_seq: u32,
    ) -> Result<bool, LedgerError> {
        if at < MIN_VALID_TIMESTAMP_MS || at > MAX_VALID_TIMESTAMP_MS {
            return Err(LedgerError::Validation("timestamp out of range"));
        }
        let ss = self
            .get_space(&space_id)
            .ok_or(LedgerError::NotFound(space_id))?;
        let mut guard = ss.write().await;

        if device != guard.meta.sensor_dev {
            return Err(LedgerError::Validation("reading from unassigned device"));
        }
        if let Some(prev) = &guard.snapshot
            && prev.device == device
            && frame_seq <= prev.frame_seq
        {
            // Duplicate or out-of-order frame — drop silently.
            return Ok(false);
        }

        let event = LedgerEvent::OccupancyRecorded {
            space_id,
            state,
            at,
            device,
            frame_seq,
        };
        self.persist_and_apply(space_id, &mut guard, &event, Some(TriggerCause::Uplink))
            .await?;
        Ok(true)
    }

    // ── Admin overrides ──────────────────────────────────────

    pub async fn set_override(
        &self,
        space_id: Ulid,
        state: OverrideState,
        now: Ms,
        expires_at: Option<Ms>,
    ) -> Result<(), LedgerError> {
        if let Some(t) = expires_at
            && t <= now
        {
            return Err(LedgerError::Validation("override already expired"));
        }
        let ss = self
            .get_space(&space_id)
            .ok_or(LedgerError::NotFound(space_id))?;
        let mut guard = ss.write().await;

        let event = LedgerEvent::OverrideSet {
            space_id,
            state,
            set_at: now,
            expires_at,
        };
        self.persist_and_apply(space_id, &mut guard, &event, Some(TriggerCause::OverrideSet))
            .await
    }

    /// Idempotent: clearing a space with no override writes nothing.
    pub async fn clear_override(
        &self,
        space_id: Ulid,
        cause: TriggerCause,
    ) -> Result<(), LedgerError> {
        let ss = self
            .get_space(&space_id)
            .ok_or(LedgerError::NotFound(space_id))?;
        let mut guard = ss.write().await;
        if guard.admin_override.is_none() {
            return Ok(());
        }

        let event = LedgerEvent::OverrideCleared { space_id };
        self.persist_and_apply(space_id, &mut guard, &event, Some(cause)).await
    }

    // ── Reaper hooks ─────────────────────────────────────────

    /// Spaces whose display-relevant state crossed a boundary in `(prev, now]`:
    /// an override expired, or an Active reservation started or ended. The
    /// reaper turns these into recompute triggers so displays flip without a
    /// fresh external event.
    pub fn collect_due_transitions(&self, prev: Ms, now: Ms) -> Vec<(Ulid, TriggerCause)> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let ss = entry.value().clone();
            if let Ok(guard) = ss.try_read() {
                if let Some(ov) = &guard.admin_override
                    && ov.expires_at.is_some_and(|t| t <= now)
                {
                    due.push((guard.meta.id, TriggerCause::OverrideExpired));
                    continue;
                }
                let crossed = guard.reservations.iter().any(|r| {
                    r.is_active()
                        && ((r.span.start > prev && r.span.start <= now)
                            || (r.span.end > prev && r.span.end <= now))
                });
                if crossed {
                    due.push((guard.meta.id, TriggerCause::ReservationBoundary));
                }
            }
        }
        due
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Rewrite the journal with only the events needed to recreate current
    /// state. Cancelled reservations older than the retention window are
    /// pruned first — idempotent re-creates of live requests must survive a
    /// restart, ancient ones need not.
    pub async fn compact_wal(&self, now: Ms, retention_ms: Ms) -> Result<(), LedgerError> {
        let mut events = Vec::new();

        let space_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for id in space_ids {
            let entry = match self.state.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let ss = entry.value().clone();
            drop(entry);
            let mut guard = ss.write().await;

            guard.reservations.retain(|r| {
                let stale = !r.is_active() && r.span.end < now - retention_ms;
                if stale {
                    self.request_index.remove(&r.request_id);
                    self.reservation_to_space.remove(&r.id);
                }
                !stale
            });

            events.push(LedgerEvent::SpaceRegistered {
                id: guard.meta.id,
                name: guard.meta.name.clone(),
                sensor_dev: guard.meta.sensor_dev,
                display_dev: guard.meta.display_dev,
                gateway: guard.meta.gateway,
                enabled: guard.meta.enabled,
            });
            for r in &guard.reservations {
                events.push(LedgerEvent::ReservationCreated {
                    id: r.id,
                    space_id: guard.meta.id,
                    span: r.span,
                    request_id: r.request_id.clone(),
                    created_at: r.created_at,
                });
                if !r.is_active() {
                    events.push(LedgerEvent::ReservationCancelled {
                        id: r.id,
                        space_id: guard.meta.id,
                    });
                }
            }
            if let Some(s) = &guard.snapshot {
                events.push(LedgerEvent::OccupancyRecorded {
                    space_id: guard.meta.id,
                    state: s.state,
                    at: s.at,
                    device: s.device,
                    frame_seq: s.frame_seq,
                });
            }
            if let Some(ov) = &guard.admin_override {
                events.push(LedgerEvent::OverrideSet {
                    space_id: guard.meta.id,
                    state: ov.state,
                    set_at: ov.set_at,
                    expires_at: ov.expires_at,
                });
            }
        }

        self.wal
            .compact(events)
            .await
            .map_err(|e| LedgerError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    // ── Internal ─────────────────────────────────────────────

    fn find_by_request_id(&self, request_id: &str) -> Option<Reservation> {
        let id = self.request_index.get(request_id).map(|e| *e.value())?;
        let space_id = self.space_for_reservation(&id)?;
        let ss = self.get_space(&space_id)?;
        let guard = ss.try_read().ok()?;
        guard.get_reservation(&id).cloned()
    }
}
