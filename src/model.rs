use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Venue-local naive milliseconds: the wall-clock reading encoded as if it were UTC.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open overlap test. Intervals that only touch at a boundary do not overlap.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingClass {
    Public,
    /// Livery client booking for one of their horses; quota-bound.
    Subscription,
    Event,
    Maintenance,
    Training,
    Lesson,
}

impl BookingClass {
    pub const ALL: [BookingClass; 6] = [
        BookingClass::Public,
        BookingClass::Subscription,
        BookingClass::Event,
        BookingClass::Maintenance,
        BookingClass::Training,
        BookingClass::Lesson,
    ];

    /// Classes only staff may book.
    pub fn requires_staff(self) -> bool {
        matches!(
            self,
            BookingClass::Event | BookingClass::Maintenance | BookingClass::Training
        )
    }

    pub fn is_quota_bound(self) -> bool {
        self == BookingClass::Subscription
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingClass::Public => "public",
            BookingClass::Subscription => "subscription",
            BookingClass::Event => "event",
            BookingClass::Maintenance => "maintenance",
            BookingClass::Training => "training",
            BookingClass::Lesson => "lesson",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for BookingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingState {
    /// Admitted but not holding capacity; waits for reconciliation.
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingState {
    pub fn is_terminal(self) -> bool {
        self == BookingState::Cancelled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingState::Pending => "pending",
            BookingState::Confirmed => "confirmed",
            BookingState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub arena_id: Ulid,
    /// Only set for subscription bookings.
    pub horse_id: Option<Ulid>,
    pub requester_id: Ulid,
    pub span: Span,
    pub class: BookingClass,
    pub state: BookingState,
    pub created_at: Ms,
    /// Engine-wide admission order. Breaks `created_at` ties during reconciliation.
    pub seq: u64,
}

impl Booking {
    pub fn is_confirmed(&self) -> bool {
        self.state == BookingState::Confirmed
    }

    pub fn is_pending(&self) -> bool {
        self.state == BookingState::Pending
    }
}

/// A request to admit a new booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub id: Ulid,
    pub arena_id: Ulid,
    pub horse_id: Option<Ulid>,
    pub requester_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub class: BookingClass,
}

/// Venue-wide quota settings for subscription bookings. `None` disables a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub max_booking_duration: Option<Ms>,
    pub min_advance_notice: Option<Ms>,
    pub max_advance_days: Option<u32>,
    /// Ceiling on total committed future time per horse.
    pub max_future_total: Option<Ms>,
    /// Ceiling per horse per calendar day.
    pub max_daily_total: Option<Ms>,
    /// Ceiling per horse per Monday-anchored week.
    pub max_weekly_total: Option<Ms>,
}

/// Hard quota rule that rejected a booking outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardRule {
    Duration { max: Ms, requested: Ms },
    MinNotice { min: Ms, lead: Ms },
    AdvanceWindow { max_days: u32, days: i64 },
}

impl HardRule {
    pub fn label(&self) -> &'static str {
        match self {
            HardRule::Duration { .. } => "duration",
            HardRule::MinNotice { .. } => "notice",
            HardRule::AdvanceWindow { .. } => "advance_window",
        }
    }
}

impl fmt::Display for HardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardRule::Duration { max, requested } => write!(
                f,
                "booking lasts {} min, longer than the {} min maximum",
                requested / MINUTE_MS,
                max / MINUTE_MS
            ),
            HardRule::MinNotice { min, lead } => write!(
                f,
                "bookings need {} min notice, this one starts in {} min",
                min / MINUTE_MS,
                lead / MINUTE_MS
            ),
            HardRule::AdvanceWindow { max_days, days } => write!(
                f,
                "bookings open {max_days} days ahead, this one is {days} days out"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Rejected(HardRule),
    /// Always `Confirmed` or `Pending`.
    Admitted(BookingState),
}

// ── Arena state ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArenaState {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    /// Every booking on this arena in any state, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl ArenaState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            active: true,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any state) whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horse {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: Option<String>,
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ArenaCreated {
        id: Ulid,
        name: Option<String>,
    },
    ArenaUpdated {
        id: Ulid,
        name: Option<String>,
        active: bool,
    },
    HorseRegistered {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
    },
    HorseRemoved {
        id: Ulid,
    },
    StaffGranted {
        id: Ulid,
    },
    StaffRevoked {
        id: Ulid,
    },
    QuotaConfigured {
        config: Option<QuotaConfig>,
    },
    BookingAdmitted {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        arena_id: Ulid,
        span: Span,
        state: BookingState,
    },
    BookingConfirmed {
        id: Ulid,
        arena_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        arena_id: Ulid,
    },
}

impl Event {
    /// Arena touched by a booking event.
    pub fn booking_arena(&self) -> Option<Ulid> {
        match self {
            Event::BookingAdmitted { booking } => Some(booking.arena_id),
            Event::BookingRescheduled { arena_id, .. }
            | Event::BookingConfirmed { arena_id, .. }
            | Event::BookingCancelled { arena_id, .. } => Some(*arena_id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
    pub confirmed: usize,
    pub pending: usize,
}

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub processed: usize,
    pub confirmed: usize,
}
