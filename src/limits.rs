//! Hard caps consulted by engine validation. Exceeding any of these is a
//! client error, not a panic.

use crate::model::Ms;

/// 2000-01-01T00:00:00Z. Nothing schedulable happened before this.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z. Keeps arithmetic far from i64 edges.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single session may not run longer than a day.
pub const MAX_SESSION_MINUTES: u32 = 24 * 60;

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_NOTES_LEN: usize = 4_000;
pub const MAX_URL_LEN: usize = 2_000;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_COMMENT_LEN: usize = 2_000;
pub const MAX_EXTERNAL_REF_LEN: usize = 200;
pub const MAX_CURRENCY_LEN: usize = 8;

pub const MAX_USERS: usize = 100_000;
pub const MAX_SERVICES: usize = 10_000;

/// Upper bound on occupancies in one calendar; a user cannot hold more
/// distinct sessions than this.
pub const MAX_SESSIONS_PER_CALENDAR: usize = 50_000;

pub const MAX_LOOKAHEAD_DAYS: u32 = 90;

/// One JSON frame on the wire, request or response.
pub const MAX_FRAME_LEN: usize = 64 * 1024;
