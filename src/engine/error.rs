use ulid::Ulid;

use crate::model::{BookingClass, BookingState, HardRule, Ms};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidSpan { start: Ms, end: Ms },
    ArenaInactive(Ulid),
    /// Overlaps the confirmed booking with this id.
    Conflict(Ulid),
    MissingHorse,
    NotOwner { horse_id: Ulid, requester_id: Ulid },
    PrivilegeRequired(BookingClass),
    QuotaRejected(HardRule),
    InvalidTransition { id: Ulid, state: BookingState },
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse grouping callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    CapacityConflict,
    Ownership,
    Privilege,
    QuotaHardRule,
    NotFound,
    State,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidSpan { .. }
            | EngineError::ArenaInactive(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict(_) => ErrorKind::CapacityConflict,
            EngineError::MissingHorse | EngineError::NotOwner { .. } => ErrorKind::Ownership,
            EngineError::PrivilegeRequired(_) => ErrorKind::Privilege,
            EngineError::QuotaRejected(_) => ErrorKind::QuotaHardRule,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) | EngineError::InvalidTransition { .. } => {
                ErrorKind::State
            }
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    /// Short label for the rejection metric.
    pub fn reason_label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidSpan { .. } => "invalid_span",
            EngineError::ArenaInactive(_) => "arena_inactive",
            EngineError::Conflict(_) => "conflict",
            EngineError::MissingHorse => "missing_horse",
            EngineError::NotOwner { .. } => "not_owner",
            EngineError::PrivilegeRequired(_) => "privilege",
            EngineError::QuotaRejected(rule) => rule.label(),
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidSpan { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::ArenaInactive(id) => write!(f, "arena {id} is not bookable"),
            EngineError::Conflict(id) => write!(f, "conflict with confirmed booking: {id}"),
            EngineError::MissingHorse => write!(f, "subscription bookings must name a horse"),
            EngineError::NotOwner {
                horse_id,
                requester_id,
            } => write!(f, "horse {horse_id} is not owned by {requester_id}"),
            EngineError::PrivilegeRequired(class) => {
                write!(f, "{class} bookings require staff privilege")
            }
            EngineError::QuotaRejected(rule) => write!(f, "quota rule violated: {rule}"),
            EngineError::InvalidTransition { id, state } => {
                write!(f, "booking {id} is {state} and cannot change")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
