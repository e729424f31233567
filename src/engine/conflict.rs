use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// First confirmed booking on the arena overlapping `span`, skipping `exclude`.
pub(crate) fn find_conflict(arena: &ArenaState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    arena
        .overlapping(span)
        .find(|b| b.is_confirmed() && Some(b.id) != exclude)
        .map(|b| b.id)
}

pub(crate) fn check_no_conflict(
    arena: &ArenaState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(arena, span, exclude) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}

impl Engine {
    /// Read-only conflict check against confirmed bookings on an arena.
    pub async fn has_conflict(
        &self,
        arena_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = Span::try_new(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
        let arena = self
            .get_arena(&arena_id)
            .ok_or(EngineError::NotFound(arena_id))?;
        let guard = arena.read().await;
        Ok(find_conflict(&guard, &span, exclude).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;

    fn arena_with(bookings: &[(Ms, Ms, BookingState)]) -> (ArenaState, Vec<Ulid>) {
        let mut arena = ArenaState::new(Ulid::new(), None);
        let mut ids = Vec::new();
        for &(start, end, state) in bookings {
            let id = Ulid::new();
            ids.push(id);
            arena.insert_booking(Booking {
                id,
                arena_id: arena.id,
                horse_id: None,
                requester_id: Ulid::nil(),
                span: Span::new(start, end),
                class: BookingClass::Public,
                state,
                created_at: 0,
                seq: ids.len() as u64,
            });
        }
        (arena, ids)
    }

    #[test]
    fn only_confirmed_bookings_conflict() {
        let (arena, _) = arena_with(&[
            (10 * H, 11 * H, BookingState::Pending),
            (10 * H, 11 * H, BookingState::Cancelled),
        ]);
        assert_eq!(find_conflict(&arena, &Span::new(10 * H, 11 * H), None), None);

        let (arena, _) = arena_with(&[(10 * H, 11 * H, BookingState::Confirmed)]);
        assert!(find_conflict(&arena, &Span::new(10 * H + H / 2, 11 * H + H / 2), None).is_some());
    }

    #[test]
    fn boundary_touching_is_free() {
        let (arena, _) = arena_with(&[(10 * H, 11 * H, BookingState::Confirmed)]);
        assert_eq!(find_conflict(&arena, &Span::new(11 * H, 12 * H), None), None);
        assert_eq!(find_conflict(&arena, &Span::new(9 * H, 10 * H), None), None);
    }

    #[test]
    fn excluded_booking_is_skipped() {
        let (arena, ids) = arena_with(&[(10 * H, 11 * H, BookingState::Confirmed)]);
        let widened = Span::new(9 * H, 12 * H);
        assert_eq!(find_conflict(&arena, &widened, Some(ids[0])), None);
        assert_eq!(find_conflict(&arena, &widened, None), Some(ids[0]));
        assert!(matches!(
            check_no_conflict(&arena, &widened, None),
            Err(EngineError::Conflict(id)) if id == ids[0]
        ));
    }

    #[test]
    fn validate_span_rejects_inverted_and_out_of_range() {
        use crate::limits::*;
        let base = MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            validate_span(base + H, base + H),
            Err(EngineError::InvalidSpan { .. })
        ));
        assert!(matches!(
            validate_span(base + 2 * H, base + H),
            Err(EngineError::InvalidSpan { .. })
        ));
        assert!(matches!(
            validate_span(0, H),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(base, base + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(validate_span(base, base + H).unwrap(), Span::new(base, base + H));
    }
}
