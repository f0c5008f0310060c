//! Hard limits. Every externally supplied value is checked against one of
//! these before it reaches a WAL record.

use crate::model::Ms;

/// Shortest bookable reservation: 15 minutes.
pub const MIN_RESERVATION_MS: Ms = 15 * 60 * 1000;

/// Widest single reservation: 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

/// 2000-01-01T00:00:00Z — nothing in this system predates it.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SPACES_PER_TENANT: usize = 100_000;

/// Active + cancelled records held per space (cancelled records age out at
/// compaction).
pub const MAX_RESERVATIONS_PER_SPACE: usize = 10_000;

pub const MAX_REQUEST_ID_LEN: usize = 128;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_TENANTS: usize = 1_000;

pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Widest `list_active` query window: 1 year.
pub const MAX_LIST_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

/// LoRaWAN downlink payloads are tiny; anything bigger is a caller bug.
pub const MAX_PAYLOAD_LEN: usize = 51;

pub const MAX_DEAD_LETTERS: usize = 100_000;

/// Fair-use ceiling for a shared gateway: 30 downlinks per minute.
pub const DEFAULT_GATEWAY_RATE_PER_MIN: u32 = 30;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const DEFAULT_BACKOFF_BASE_MS: Ms = 2_000;

pub const DEFAULT_BACKOFF_CAP_MS: Ms = 5 * 60_000;
