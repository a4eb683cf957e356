use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single charging session longer than a week is treated as garbage input.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_TRACKED_BOOKINGS: usize = 100_000;

/// Live messages held back while the snapshot loads.
pub const MAX_PENDING_EVENTS: usize = 10_000;

/// Rejected records kept for diagnostics.
pub const MAX_RECENT_REJECTIONS: usize = 64;

pub const MAX_SNAPSHOT_RECORDS: usize = 100_000;
