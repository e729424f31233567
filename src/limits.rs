//! Hard limits applied at the engine and venue boundaries.

use crate::model::Ms;

pub const MAX_VENUES: usize = 1024;
pub const MAX_VENUE_NAME_LEN: usize = 256;

pub const MAX_ARENAS_PER_VENUE: usize = 10_000;
pub const MAX_HORSES_PER_VENUE: usize = 100_000;
pub const MAX_STAFF_PER_VENUE: usize = 10_000;
pub const MAX_BOOKINGS_PER_ARENA: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

/// 2000-01-01T00:00:00
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking never spans more than 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;
/// Listing window ceiling (one year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const DAY_MS: Ms = 86_400_000;
