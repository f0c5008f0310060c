use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Current wall clock in Unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Sensor-reported occupancy of a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyState {
    Free,
    Occupied,
    Unknown,
}

/// What an admin pins a display to, regardless of sensors and bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideState {
    Free,
    Occupied,
    Reserved,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

/// A booking on a space. Immutable once created except for the
/// Active → Cancelled status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub span: Span,
    /// Caller-supplied idempotency key.
    pub request_id: String,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Active and covering the given instant.
    pub fn covers(&self, now: Ms) -> bool {
        self.is_active() && self.span.contains_instant(now)
    }
}

/// Last accepted sensor reading for a space. `frame_seq` is the uplink frame
/// counter used to reject duplicate and out-of-order readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub state: OccupancyState,
    pub at: Ms,
    pub device: Ulid,
    pub frame_seq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminOverride {
    pub state: OverrideState,
    pub set_at: Ms,
    /// None = never expires; otherwise cleared by the reaper.
    pub expires_at: Option<Ms>,
}

impl AdminOverride {
    pub fn expired(&self, now: Ms) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// A physical parking space and its device assignments. Tenant scoping comes
/// from the per-tenant ledger the space lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMeta {
    pub id: Ulid,
    pub name: Option<String>,
    pub sensor_dev: Ulid,
    pub display_dev: Ulid,
    pub gateway: Ulid,
    pub enabled: bool,
}

/// Full in-memory state of one space: metadata, the reservation calendar
/// (active + cancelled, sorted by start), the latest sensor snapshot, and
/// an optional admin override.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub meta: SpaceMeta,
    /// All reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    pub snapshot: Option<OccupancySnapshot>,
    pub admin_override: Option<AdminOverride>,
}

impl SpaceState {
    pub fn new(meta: SpaceMeta) -> Self {
        Self {
            meta,
            reservations: Vec::new(),
            snapshot: None,
            admin_override: None,
        }
    }

    /// Insert a reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn get_reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Active reservations overlapping the query window.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query).filter(|r| r.is_active())
    }

    /// The Active reservation covering `now`, if any. At most one exists by
    /// the no-overlap invariant.
    pub fn active_covering(&self, now: Ms) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.covers(now))
    }
}

// ── Downlink side ────────────────────────────────────────────────

/// Deterministic digest of a downlink payload. Identical `(fport, payload)`
/// always hashes identically; used for coalescing equality and for
/// suppressing retransmission of an already-delivered command.
pub fn content_hash(fport: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[fport]);
    hasher.update(payload);
    hasher.finalize()
}

/// The command a display device should show. Derived by the state engine,
/// owned by the downlink queue once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayCommand {
    pub space: Ulid,
    pub device: Ulid,
    pub gateway: Ulid,
    pub fport: u8,
    pub payload: Vec<u8>,
    pub hash: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownlinkStatus {
    Pending,
    InFlight,
    Delivered,
    DeadLettered,
}

/// One queued downlink. The queue holds at most one Pending/InFlight item
/// per device plus one follow-up parked behind an in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkItem {
    pub id: Ulid,
    pub space: Ulid,
    pub device: Ulid,
    pub gateway: Ulid,
    pub payload: Vec<u8>,
    pub fport: u8,
    pub hash: u32,
    pub created_at: Ms,
    pub attempts: u32,
    pub next_eligible: Ms,
    pub status: DownlinkStatus,
}

impl DownlinkItem {
    pub fn from_command(id: Ulid, cmd: &DisplayCommand, now: Ms) -> Self {
        Self {
            id,
            space: cmd.space,
            device: cmd.device,
            gateway: cmd.gateway,
            payload: cmd.payload.clone(),
            fport: cmd.fport,
            hash: cmd.hash,
            created_at: now,
            attempts: 0,
            next_eligible: now,
            status: DownlinkStatus::Pending,
        }
    }
}

// ── WAL record types ─────────────────────────────────────────────

/// Ledger journal records — flat, no nesting. One WAL file per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    SpaceRegistered {
        id: Ulid,
        name: Option<String>,
        sensor_dev: Ulid,
        display_dev: Ulid,
        gateway: Ulid,
        enabled: bool,
    },
    SpaceUpdated {
        id: Ulid,
        name: Option<String>,
        sensor_dev: Ulid,
        display_dev: Ulid,
        gateway: Ulid,
        enabled: bool,
    },
    SpaceRemoved {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        space_id: Ulid,
        span: Span,
        request_id: String,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        space_id: Ulid,
    },
    OccupancyRecorded {
        space_id: Ulid,
        state: OccupancyState,
        at: Ms,
        device: Ulid,
        frame_seq: u32,
    },
    OverrideSet {
        space_id: Ulid,
        state: OverrideState,
        set_at: Ms,
        expires_at: Option<Ms>,
    },
    OverrideCleared {
        space_id: Ulid,
    },
}

/// Downlink queue journal records. One global WAL file. Coalescing is not a
/// separate record: applying `Enqueued` onto an occupied slot replaces a
/// Pending item and parks behind an InFlight one, identically live and on
/// replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    Enqueued { item: DownlinkItem },
    AttemptStarted { id: Ulid, device: Ulid, at: Ms },
    Delivered { id: Ulid, device: Ulid, hash: u32, at: Ms },
    RetryScheduled {
        id: Ulid,
        device: Ulid,
        attempts: u32,
        next_eligible: Ms,
    },
    DeadLettered {
        id: Ulid,
        device: Ulid,
        at: Ms,
        attempts: u32,
        reason: String,
    },
    Requeued { id: Ulid, at: Ms },
    Purged { id: Ulid },
}
