mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::LedgerError;
pub use queries::DisplayInputs;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::trigger::{Trigger, TriggerCause, TriggerHub};
use crate::wal::{Wal, WalHandle};

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;

/// Tenant-scoped reservation ledger: the space registry, the reservation
/// calendar, occupancy snapshots, and admin overrides, all journaled to a
/// per-tenant WAL. Creation conflicts are serialized by the per-space write
/// lock; the idempotency index maps request ids to reservations.
pub struct Ledger {
    tenant: String,
    pub state: DashMap<Ulid, SharedSpaceState>,
    wal: WalHandle<LedgerEvent>,
    triggers: Arc<TriggerHub>,
    /// Idempotency index: request_id → reservation id (tenant-scoped).
    pub(super) request_index: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → space id.
    pub(super) reservation_to_space: DashMap<Ulid, Ulid>,
}

/// Apply an event directly to a SpaceState (no locking — caller holds the lock).
fn apply_to_space(
    ss: &mut SpaceState,
    event: &LedgerEvent,
    request_index: &DashMap<String, Ulid>,
    reservation_to_space: &DashMap<Ulid, Ulid>,
) {
    match event {
        LedgerEvent::ReservationCreated {
            id,
            space_id,
            span,
            request_id,
            created_at,
        } => {
            ss.insert_reservation(Reservation {
                id: *id,
                span: *span,
                request_id: request_id.clone(),
                status: ReservationStatus::Active,
                created_at: *created_at,
            });
            request_index.insert(request_id.clone(), *id);
            reservation_to_space.insert(*id, *space_id);
        }
        LedgerEvent::ReservationCancelled { id, .. } => {
            if let Some(r) = ss.get_reservation_mut(id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        LedgerEvent::OccupancyRecorded {
            state,
            at,
            device,
            frame_seq,
            ..
        } => {
            ss.snapshot = Some(OccupancySnapshot {
                state: *state,
                at: *at,
                device: *device,
                frame_seq: *frame_seq,
            });
        }
        LedgerEvent::OverrideSet {
            state,
            set_at,
            expires_at,
            ..
        } => {
            ss.admin_override = Some(AdminOverride {
                state: *state,
                set_at: *set_at,
                expires_at: *expires_at,
            });
        }
        LedgerEvent::OverrideCleared { .. } => {
            ss.admin_override = None;
        }
        LedgerEvent::SpaceUpdated {
            name,
            sensor_dev,
            display_dev,
            gateway,
            enabled,
            ..
        } => {
            ss.meta.name = name.clone();
            ss.meta.sensor_dev = *sensor_dev;
            ss.meta.display_dev = *display_dev;
            ss.meta.gateway = *gateway;
            ss.meta.enabled = *enabled;
        }
        // SpaceRegistered/Removed are handled at the DashMap level, not here
        LedgerEvent::SpaceRegistered { .. } | LedgerEvent::SpaceRemoved { .. } => {}
    }
}

impl Ledger {
    pub fn open(
        tenant: String,
        wal_path: PathBuf,
        triggers: Arc<TriggerHub>,
    ) -> io::Result<Self> {
        let events = Wal::<LedgerEvent>::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?, "ledger");

        let ledger = Self {
            tenant,
            state: DashMap::new(),
            wal,
            triggers,
            request_index: DashMap::new(),
            reservation_to_space: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context (lazy tenant creation).
        for event in &events {
            match event {
                LedgerEvent::SpaceRegistered {
                    id,
                    name,
                    sensor_dev,
                    display_dev,
                    gateway,
                    enabled,
                } => {
                    let ss = SpaceState::new(SpaceMeta {
                        id: *id,
                        name: name.clone(),
                        sensor_dev: *sensor_dev,
                        display_dev: *display_dev,
                        gateway: *gateway,
                        enabled: *enabled,
                    });
                    ledger.state.insert(*id, Arc::new(RwLock::new(ss)));
                }
                LedgerEvent::SpaceRemoved { id } => {
                    ledger.drop_space_indexes(id);
                    ledger.state.remove(id);
                }
                other => {
                    if let Some(space_id) = event_space_id(other)
                        && let Some(entry) = ledger.state.get(&space_id)
                    {
                        let ss_arc = entry.clone();
                        let mut guard = ss_arc.try_write().expect("replay: uncontended write");
                        apply_to_space(
                            &mut guard,
                            other,
                            &ledger.request_index,
                            &ledger.reservation_to_space,
                        );
                    }
                }
            }
        }

        Ok(ledger)
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Write an event to the per-tenant journal via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| LedgerError::WalError(e.to_string()))
    }

    pub fn get_space(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn space_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_space
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + trigger in one call.
    pub(super) async fn persist_and_apply(
        &self,
        space_id: Ulid,
        ss: &mut SpaceState,
        event: &LedgerEvent,
        cause: Option<TriggerCause>,
    ) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.request_index, &self.reservation_to_space);
        if let Some(cause) = cause {
            self.trigger_recompute(space_id, cause);
        }
        Ok(())
    }

    pub fn trigger_recompute(&self, space_id: Ulid, cause: TriggerCause) {
        self.triggers.send(Trigger {
            tenant: self.tenant.clone(),
            space: space_id,
            cause,
        });
    }

    /// Lookup reservation → space, get space, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SpaceState>), LedgerError> {
        let space_id = self
            .space_for_reservation(reservation_id)
            .ok_or(LedgerError::NotFound(*reservation_id))?;
        let ss = self
            .get_space(&space_id)
            .ok_or(LedgerError::NotFound(space_id))?;
        let guard = ss.write_owned().await;
        Ok((space_id, guard))
    }

    /// Drop index entries for every reservation of a space about to be removed.
    fn drop_space_indexes(&self, space_id: &Ulid) {
        if let Some(entry) = self.state.get(space_id) {
            let ss = entry.value().clone();
            let guard = ss.try_read().expect("remove: uncontended read");
            for r in &guard.reservations {
                self.request_index.remove(&r.request_id);
                self.reservation_to_space.remove(&r.id);
            }
        }
    }
}

/// Extract the space_id from an event (for non-Register/Remove events).
fn event_space_id(event: &LedgerEvent) -> Option<Ulid> {
    match event {
        LedgerEvent::ReservationCreated { space_id, .. }
        | LedgerEvent::ReservationCancelled { space_id, .. }
        | LedgerEvent::OccupancyRecorded { space_id, .. }
        | LedgerEvent::OverrideSet { space_id, .. }
        | LedgerEvent::OverrideCleared { space_id } => Some(*space_id),
        LedgerEvent::SpaceUpdated { id, .. } => Some(*id),
        LedgerEvent::SpaceRegistered { .. } | LedgerEvent::SpaceRemoved { .. } => None,
    }
}
