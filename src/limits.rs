//! Input bounds. A misbehaving client must not be able to balloon state.

/// Candidate slot starts are generated on this grid.
pub const SLOT_GRID_MIN: crate::model::Minute = 30;

/// Default hold lifetime when `BAYLINE_HOLD_TTL_SECS` is unset.
pub const DEFAULT_HOLD_TTL_SECS: u64 = 300;

pub const MAX_SERVICES: usize = 256;
pub const MAX_NAME_LEN: usize = 120;
pub const MAX_LABEL_LEN: usize = 200;
pub const MAX_BOOKINGS_PER_DAY: usize = 1024;
pub const MAX_HOLDS: usize = 4096;
pub const MAX_MAINTENANCE_PER_DAY: usize = 64;

/// One request per line; anything longer is a protocol violation.
pub const MAX_LINE_LEN: usize = 8192;

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 50;
