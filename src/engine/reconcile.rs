use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    RECONCILE_CONFIRMED_TOTAL, RECONCILE_DURATION_SECONDS, RECONCILE_RUNS_TOTAL,
};

use super::conflict::find_conflict;
use super::quota::end_of_tomorrow;
use super::{Engine, EngineError};

/// Reconciliation horizon used when the caller doesn't pick one.
pub fn default_horizon(now: Ms) -> Ms {
    end_of_tomorrow(now)
}

/// A pending booking picked up by a run, in promotion order: request time,
/// then admission sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    created_at: Ms,
    seq: u64,
    id: Ulid,
    arena_id: Ulid,
}

impl Engine {
    /// Promote pending bookings starting on or before `horizon_end`, oldest request first.
    ///
    /// Each promotion is visible to the conflict check of every later candidate in
    /// the same run. Bookings that still conflict stay pending. Only a storage error
    /// stops a run early; whatever was promoted before it stays promoted.
    pub async fn run_reconciliation(&self, horizon_end: Ms) -> Result<ReconcileReport, EngineError> {
        let _run = self.reconcile_lock.lock().await;
        let started = Instant::now();

        let candidates = self.pending_candidates(horizon_end).await;
        let mut report = ReconcileReport::default();
        let result = self.promote_all(&candidates, horizon_end, &mut report).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(RECONCILE_RUNS_TOTAL, "status" => status).increment(1);
        metrics::counter!(RECONCILE_CONFIRMED_TOTAL).increment(report.confirmed as u64);
        metrics::histogram!(RECONCILE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        result?;
        info!(
            "reconciliation up to {horizon_end}: {} processed, {} confirmed",
            report.processed, report.confirmed
        );
        Ok(report)
    }

    /// Reconcile with the default horizon (end of tomorrow).
    pub async fn reconcile_due(&self) -> Result<ReconcileReport, EngineError> {
        self.run_reconciliation(default_horizon(self.now())).await
    }

    /// Snapshot of every pending booking due by the horizon, in FCFS order.
    async fn pending_candidates(&self, horizon_end: Ms) -> Vec<Candidate> {
        let arenas: Vec<_> = self.arenas.iter().map(|e| e.value().clone()).collect();
        let mut candidates = Vec::new();
        for arena in arenas {
            let guard = arena.read().await;
            candidates.extend(
                guard
                    .bookings
                    .iter()
                    .take_while(|b| b.span.start <= horizon_end)
                    .filter(|b| b.is_pending())
                    .map(|b| Candidate {
                        created_at: b.created_at,
                        seq: b.seq,
                        id: b.id,
                        arena_id: b.arena_id,
                    }),
            );
        }
        candidates.sort();
        candidates
    }

    async fn promote_all(
        &self,
        candidates: &[Candidate],
        horizon_end: Ms,
        report: &mut ReconcileReport,
    ) -> Result<(), EngineError> {
        for candidate in candidates {
            report.processed += 1;
            if self.try_promote(candidate, horizon_end).await? {
                report.confirmed += 1;
            }
        }
        Ok(())
    }

    /// Confirm one pending booking if nothing confirmed overlaps it.
    async fn try_promote(&self, candidate: &Candidate, horizon_end: Ms) -> Result<bool, EngineError> {
        let Some(arena) = self.get_arena(&candidate.arena_id) else {
            return Ok(false);
        };
        let mut guard = arena.write().await;
        // Re-read under the write lock: it may have been cancelled or moved since the snapshot.
        let Some(booking) = guard.booking(candidate.id) else {
            return Ok(false);
        };
        if !booking.is_pending() || booking.span.start > horizon_end {
            debug!("booking {} changed since snapshot, skipped", candidate.id);
            return Ok(false);
        }
        if let Some(blocker) = find_conflict(&guard, &booking.span, Some(candidate.id)) {
            debug!("booking {} stays pending, blocked by {blocker}", candidate.id);
            return Ok(false);
        }
        let event = Event::BookingConfirmed {
            id: candidate.id,
            arena_id: candidate.arena_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("booking {} promoted to confirmed", candidate.id);
        Ok(true)
    }
}
