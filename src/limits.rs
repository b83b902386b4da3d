use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 180;
pub const MAX_DEPARTMENT_LEN: usize = 120;
pub const MAX_PURPOSE_LEN: usize = 2_000;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_NOTE_LEN: usize = 1_000;
pub const MAX_TITLE_LEN: usize = 240;
pub const MAX_URL_LEN: usize = 2_048;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_214_400_000;

/// A single booking may not exceed 31 days.
pub const MAX_BOOKING_DURATION_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_BOOKINGS_PER_LAB: usize = 100_000;
pub const MAX_SLOTS_PER_LAB: usize = 100_000;
pub const MAX_SLOTS_PER_BATCH: usize = 10_000;
pub const MAX_LABS: usize = 10_000;

/// Largest WAL record payload. A longer length prefix is read as a torn tail.
pub const MAX_WAL_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
