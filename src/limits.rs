use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

/// Slots returned when the caller does not ask for a specific count.
pub const DEFAULT_SLOT_LIMIT: usize = 32;
pub const MAX_SLOT_LIMIT: usize = 200;

/// Window used when the caller omits `end_ts`.
pub const DEFAULT_QUERY_WINDOW_MS: Ms = 30 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 90 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_PLATE_LEN: usize = 16;
pub const VIN_LEN: usize = 17;
pub const MAX_RECOMMENDATION_LEN: usize = 1024;

/// Larger length prefixes in the WAL are treated as corruption.
pub const MAX_WAL_RECORD_LEN: usize = 1 << 20;

/// First year a motor car was sold; anything earlier is a typo.
pub const MIN_PRODUCTION_YEAR: i32 = 1886;
