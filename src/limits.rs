//! Hard limits. Requests beyond these fail with `LimitExceeded` before touching any lock.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_ROOM_TYPES: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 256;

/// Upper bound on configurable stay length and booking horizon.
pub const MAX_STAY_NIGHTS_CAP: u32 = 365;
pub const MAX_HORIZON_DAYS_CAP: u32 = 3 * 366;

/// Widest window a calendar read-out may cover.
pub const MAX_CALENDAR_WINDOW_DAYS: i64 = 400;

/// Maximum line length accepted on the wire.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
