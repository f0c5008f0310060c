//! The display state engine: a pure function from one space's observable
//! state to the command its display should show. All time comes in through
//! the `now` argument — identical inputs always yield identical output.

use crate::model::*;
use crate::policy::{DisplayPolicy, Look};

/// Which input won the priority chain. Highest first: admin override, then
/// an Active reservation covering now, then the sensor, then the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Override(OverrideState),
    Reserved,
    Occupied,
    Free,
    Unknown,
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Override(_) => "override",
            Resolution::Reserved => "reserved",
            Resolution::Occupied => "occupied",
            Resolution::Free => "free",
            Resolution::Unknown => "unknown",
        }
    }
}

/// The priority chain as one ordered match.
pub fn resolve(
    occupancy: Option<&OccupancySnapshot>,
    reservation: Option<&Reservation>,
    admin_override: Option<&AdminOverride>,
    now: Ms,
) -> Resolution {
    if let Some(ov) = admin_override
        && !ov.expired(now)
    {
        return Resolution::Override(ov.state);
    }
    if let Some(r) = reservation
        && r.covers(now)
    {
        return Resolution::Reserved;
    }
    match occupancy.map(|s| s.state) {
        Some(OccupancyState::Occupied) => Resolution::Occupied,
        Some(OccupancyState::Free) => Resolution::Free,
        Some(OccupancyState::Unknown) | None => Resolution::Unknown,
    }
}

fn look_for(policy: &DisplayPolicy, resolution: Resolution) -> Look {
    match resolution {
        Resolution::Override(OverrideState::Free) | Resolution::Free => policy.free,
        Resolution::Override(OverrideState::Occupied) | Resolution::Occupied => policy.occupied,
        Resolution::Override(OverrideState::Reserved) | Resolution::Reserved => policy.reserved,
        Resolution::Override(OverrideState::Closed) => policy.closed,
        Resolution::Unknown => policy.unknown,
    }
}

/// Compute the display command for a space. Referentially transparent: no
/// clock reads, no I/O — the caller hands the command to the downlink queue.
pub fn compute(
    space: &SpaceMeta,
    policy: &DisplayPolicy,
    occupancy: Option<&OccupancySnapshot>,
    reservation: Option<&Reservation>,
    admin_override: Option<&AdminOverride>,
    now: Ms,
) -> DisplayCommand {
    let resolution = resolve(occupancy, reservation, admin_override, now);
    let look = look_for(policy, resolution);
    let payload = vec![look.color, look.pattern];
    let hash = content_hash(policy.fport, &payload);
    DisplayCommand {
        space: space.id,
        device: space.display_dev,
        gateway: space.gateway,
        fport: policy.fport,
        payload,
        hash,
    }
}
