use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Ledger, LedgerError};

/// Everything the state engine reads for one recompute, captured under a
/// single lock so the inputs are mutually consistent.
#[derive(Debug, Clone)]
pub struct DisplayInputs {
    pub meta: SpaceMeta,
    pub snapshot: Option<OccupancySnapshot>,
    pub reservation: Option<Reservation>,
    pub admin_override: Option<AdminOverride>,
}

impl Ledger {
    /// Active reservations overlapping the window, ordered by start time.
    pub async fn list_active(
        &self,
        space_id: Ulid,
        window: Span,
    ) -> Result<Vec<Reservation>, LedgerError> {
        if window.duration_ms() > MAX_LIST_WINDOW_MS {
            return Err(LedgerError::LimitExceeded("query window too wide"));
        }
        let ss = match self.get_space(&space_id) {
            Some(ss) => ss,
            None => return Ok(vec![]),
        };
        let guard = ss.read().await;
        // The backing vec is kept sorted by start, so no re-sort needed.
        Ok(guard.active_overlapping(&window).cloned().collect())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let space_id = self.space_for_reservation(&id)?;
        let ss = self.get_space(&space_id)?;
        let guard = ss.read().await;
        guard.get_reservation(&id).cloned()
    }

    pub fn list_spaces(&self) -> Vec<SpaceMeta> {
        self.state
            .iter()
            .map(|entry| {
                let ss = entry.value().clone();
                let guard = ss.try_read().expect("list_spaces: uncontended read");
                guard.meta.clone()
            })
            .collect()
    }

    pub async fn get_space_meta(&self, id: Ulid) -> Option<SpaceMeta> {
        let ss = self.get_space(&id)?;
        let guard = ss.read().await;
        Some(guard.meta.clone())
    }

    pub async fn get_snapshot(&self, space_id: Ulid) -> Option<OccupancySnapshot> {
        let ss = self.get_space(&space_id)?;
        let guard = ss.read().await;
        guard.snapshot
    }

    /// One consistent read of all state-engine inputs for a space. An
    /// already-expired override is filtered here so the engine never sees it.
    pub async fn display_inputs(&self, space_id: Ulid, now: Ms) -> Option<DisplayInputs> {
        let ss = self.get_space(&space_id)?;
        let guard = ss.read().await;
        Some(DisplayInputs {
            meta: guard.meta.clone(),
            snapshot: guard.snapshot,
            reservation: guard.active_covering(now).cloned(),
            admin_override: guard.admin_override.filter(|ov| !ov.expired(now)),
        })
    }
}
