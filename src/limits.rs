use crate::model::Ms;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESC_LEN: usize = 16 * 1024;
pub const MAX_ROOMS_PER_LOCATION: usize = 1_000;
pub const MAX_EVENTS_PER_ROOM: usize = 50_000;
pub const MAX_CREATORS_PER_EVENT: usize = 64;
pub const MAX_TICKETS_PER_CALL: u32 = 100_000;

/// 1970-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// One year.
pub const MAX_EVENT_DURATION_MS: Ms = 366 * 24 * 3_600_000;
