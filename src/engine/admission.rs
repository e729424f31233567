use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_ARENA;
use crate::model::*;
use crate::observability::{ADMISSIONS_TOTAL, REJECTIONS_TOTAL};

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Decide the initial state of a new booking and persist it.
    ///
    /// Checks run in a fixed order: interval, arena, capacity conflict, horse
    /// ownership and quota (subscription only), staff privilege. Nothing is
    /// written unless every check passes. The arena's write lock is held from
    /// the conflict check through the WAL append, and the booking id is claimed
    /// before the lock is awaited so concurrent requests cannot share an id.
    pub async fn admit(&self, draft: BookingDraft) -> Result<Booking, EngineError> {
        let class = draft.class;
        let result = self.admit_inner(draft).await;
        match &result {
            Ok(booking) => {
                metrics::counter!(ADMISSIONS_TOTAL, "class" => class.as_str(), "state" => booking.state.as_str())
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(REJECTIONS_TOTAL, "reason" => e.reason_label()).increment(1);
                debug!("rejected {class} booking: {e}");
            }
        }
        result
    }

    async fn admit_inner(&self, draft: BookingDraft) -> Result<Booking, EngineError> {
        let span = validate_span(draft.start, draft.end)?;
        let claim = self.claim_booking_id(draft.id, draft.arena_id)?;
        let arena = self
            .get_arena(&draft.arena_id)
            .ok_or(EngineError::NotFound(draft.arena_id))?;
        let mut guard = arena.write().await;
        if !guard.active {
            return Err(EngineError::ArenaInactive(draft.arena_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ARENA {
            return Err(EngineError::LimitExceeded("too many bookings on arena"));
        }

        check_no_conflict(&guard, &span, None)?;

        let (horse_id, state) = if draft.class.is_quota_bound() {
            let horse_id = self.check_ownership(draft.horse_id, draft.requester_id)?;
            let verdict = self.evaluate_quota(horse_id, span, None).await;
            (Some(horse_id), verdict_state(verdict)?)
        } else {
            (None, BookingState::Confirmed)
        };

        if draft.class.requires_staff() && !self.staff.contains(&draft.requester_id) {
            return Err(EngineError::PrivilegeRequired(draft.class));
        }

        let booking = Booking {
            id: draft.id,
            arena_id: draft.arena_id,
            horse_id,
            requester_id: draft.requester_id,
            span,
            class: draft.class,
            state,
            created_at: self.now(),
            seq: self.next_admit_seq(),
        };
        let event = Event::BookingAdmitted {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        claim.keep();
        info!(
            "admitted {} booking {} on arena {} as {}",
            booking.class, booking.id, booking.arena_id, booking.state
        );
        Ok(booking)
    }

    /// Move a booking to a new interval on the same arena, re-running admission
    /// with the booking itself excluded from the conflict and quota checks.
    ///
    /// Subscription bookings take the state of the fresh quota verdict, so a
    /// confirmed booking can drop back to pending and vice versa.
    pub async fn reschedule(&self, id: Ulid, start: Ms, end: Ms) -> Result<Booking, EngineError> {
        let span = validate_span(start, end)?;
        let (_, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.state.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id,
                state: current.state,
            });
        }
        if !guard.active {
            return Err(EngineError::ArenaInactive(current.arena_id));
        }

        check_no_conflict(&guard, &span, Some(id))?;

        let state = if current.class.is_quota_bound() {
            let horse_id = self.check_ownership(current.horse_id, current.requester_id)?;
            verdict_state(self.evaluate_quota(horse_id, span, Some(id)).await)?
        } else {
            current.state
        };

        let event = Event::BookingRescheduled {
            id,
            arena_id: current.arena_id,
            span,
            state,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "rescheduled booking {id} to [{}, {}) as {state}",
            span.start, span.end
        );
        Ok(Booking {
            span,
            state,
            ..current
        })
    }

    /// Cancel without any capacity or quota checks. Cancelling twice is a no-op.
    pub async fn cancel(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (arena_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.state.is_terminal() {
            return Ok(current);
        }
        let event = Event::BookingCancelled { id, arena_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("cancelled booking {id}");
        Ok(Booking {
            state: BookingState::Cancelled,
            ..current
        })
    }

    /// The named horse must exist and belong to the requester.
    fn check_ownership(&self, horse_id: Option<Ulid>, requester_id: Ulid) -> Result<Ulid, EngineError> {
        let horse_id = horse_id.ok_or(EngineError::MissingHorse)?;
        let owned = self
            .horses
            .get(&horse_id)
            .is_some_and(|horse| horse.owner_id == requester_id);
        if owned {
            Ok(horse_id)
        } else {
            Err(EngineError::NotOwner {
                horse_id,
                requester_id,
            })
        }
    }
}

fn verdict_state(verdict: AdmissionVerdict) -> Result<BookingState, EngineError> {
    match verdict {
        AdmissionVerdict::Rejected(rule) => Err(EngineError::QuotaRejected(rule)),
        AdmissionVerdict::Admitted(state) => Ok(state),
    }
}
