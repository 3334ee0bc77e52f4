use crate::timerange::{DAY_MS, Ms};

// ── Scheduling ───────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_AVATAR_LEN: usize = 2048;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// No lesson runs longer than a day.
pub const MAX_SPAN_DURATION_MS: Ms = DAY_MS;

/// Random characters appended to the link base URL.
pub const LINK_TOKEN_LEN: usize = 10;
/// Fresh tokens tried before a link collision is reported as a store failure.
pub const MAX_LINK_ATTEMPTS: usize = 3;

/// Upcoming window for slots a teacher created.
pub const CREATED_WINDOW_WEEKS: u32 = 2;
/// Upcoming window for booked slots, from either side.
pub const BOOKED_WINDOW_WEEKS: u32 = 1;

// ── Chat ─────────────────────────────────────────────────────────

pub const DEFAULT_HISTORY_CAPACITY: usize = 500;
/// Rooms whose history is kept at once; the least recently used is dropped.
pub const DEFAULT_HISTORY_MAX_ROOMS: u64 = 10_000;
/// History of a room nobody has written to or read for this long is dropped.
pub const HISTORY_IDLE_SECS: u64 = 7 * 24 * 3600;
pub const MAX_ROOM_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PAYLOAD_LEN: usize = 4096;

// ── Transport ────────────────────────────────────────────────────

pub const MAX_LINE_LEN: usize = 16 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
