//! Quota policy for subscription bookings.
//!
//! Hard rules (duration, notice, advance window) reject. Soft rules (future, daily
//! and weekly committed time per horse) queue the booking as pending instead.

use chrono::{DateTime, Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::DAY_MS;
use crate::model::*;

use super::Engine;

/// Calendar date of a venue-local instant.
pub fn local_date(t: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(t)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

fn midnight(date: NaiveDate) -> Ms {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

/// `[00:00, next 00:00)` of the calendar day containing `t`.
pub fn day_bounds(t: Ms) -> Span {
    let start = midnight(local_date(t));
    Span::new(start, start + DAY_MS)
}

/// Monday-anchored week containing `t`.
pub fn week_bounds(t: Ms) -> Span {
    let date = local_date(t);
    let from_monday = i64::from(date.weekday().num_days_from_monday());
    let start = midnight(date) - from_monday * DAY_MS;
    Span::new(start, start + 7 * DAY_MS)
}

/// Last millisecond of tomorrow; the default reconciliation horizon.
pub fn end_of_tomorrow(now: Ms) -> Ms {
    day_bounds(now).end + DAY_MS - 1
}

/// Evaluate a candidate against the horse's confirmed history.
///
/// `history` holds the spans of the horse's confirmed bookings, with the booking
/// being rescheduled (if any) already removed.
pub fn evaluate(
    candidate: &Span,
    history: &[Span],
    config: Option<&QuotaConfig>,
    now: Ms,
) -> AdmissionVerdict {
    let Some(config) = config else {
        return AdmissionVerdict::Admitted(BookingState::Confirmed);
    };
    let duration = candidate.duration_ms();

    if let Some(max) = config.max_booking_duration
        && duration > max
    {
        return AdmissionVerdict::Rejected(HardRule::Duration {
            max,
            requested: duration,
        });
    }

    if let Some(min) = config.min_advance_notice {
        let lead = candidate.start - now;
        if lead < min {
            return AdmissionVerdict::Rejected(HardRule::MinNotice { min, lead });
        }
    }

    if let Some(max_days) = config.max_advance_days {
        let days = (local_date(candidate.start) - local_date(now)).num_days();
        if days > i64::from(max_days) {
            return AdmissionVerdict::Rejected(HardRule::AdvanceWindow { max_days, days });
        }
    }

    let mut over = false;

    if let Some(max) = config.max_future_total {
        let committed: Ms = history
            .iter()
            .filter(|s| s.end > now)
            .map(Span::duration_ms)
            .sum();
        over = committed + duration > max;
    }

    if !over && let Some(max) = config.max_daily_total {
        over = committed_within(history, &day_bounds(candidate.start)) + duration > max;
    }

    if !over && let Some(max) = config.max_weekly_total {
        over = committed_within(history, &week_bounds(candidate.start)) + duration > max;
    }

    if over {
        AdmissionVerdict::Admitted(BookingState::Pending)
    } else {
        AdmissionVerdict::Admitted(BookingState::Confirmed)
    }
}

/// Total duration of bookings whose start falls inside `window`.
fn committed_within(history: &[Span], window: &Span) -> Ms {
    history
        .iter()
        .filter(|s| window.contains_instant(s.start))
        .map(Span::duration_ms)
        .sum()
}

impl Engine {
    /// Confirmed spans of a horse across every arena, minus `exclude`.
    pub(super) fn horse_history(&self, horse_id: &Ulid, exclude: Option<Ulid>) -> Vec<Span> {
        self.indexes
            .horse_ledger
            .get(horse_id)
            .map(|ledger| {
                ledger
                    .iter()
                    .filter(|(id, _)| Some(**id) != exclude)
                    .map(|(_, span)| *span)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run the quota policy for a horse using the current configuration snapshot.
    pub async fn evaluate_quota(
        &self,
        horse_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> AdmissionVerdict {
        let config = self.quota_config().await;
        let history = self.horse_history(&horse_id, exclude);
        evaluate(&span, &history, config.as_ref(), self.now())
    }
}
