use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::model::ReconcileReport;

/// How often the compactor checks the WAL append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that promotes pending bookings up to the end of tomorrow.
///
/// Calls the same entry point as `SELECT * FROM reconcile`, so a manual run and a
/// timed run never differ.
pub async fn run_reconciler(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        reconcile_tick(&engine).await;
    }
}

/// One timed reconciliation. Errors are logged; the next tick retries.
pub async fn reconcile_tick(engine: &Engine) -> Option<ReconcileReport> {
    match engine.reconcile_due().await {
        Ok(report) => {
            if report.confirmed > 0 {
                info!(
                    "reconciler promoted {} of {} pending bookings",
                    report.confirmed, report.processed
                );
            }
            Some(report)
        }
        Err(e) => {
            error!("reconciliation run failed: {e}");
            None
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Compact when at least `threshold` events were appended since the last compaction.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends, below threshold {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    /// Wednesday 2025-01-15 08:00.
    const NOW: Ms = 1_736_928_000_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("paddock_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Engine with one arena and two pending bookings on the same slot tomorrow.
    async fn contested(name: &str) -> (Arc<Engine>, Ulid, Ulid) {
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = Arc::new(Engine::new(test_wal_path(name), clock.clone()).unwrap());
        let (arena, horse, owner) = (Ulid::new(), Ulid::new(), Ulid::new());
        engine.create_arena(arena, None).await.unwrap();
        engine.register_horse(horse, owner, None).await.unwrap();
        engine
            .set_quota_config(Some(QuotaConfig {
                max_future_total: Some(0),
                ..Default::default()
            }))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let booking = engine
                .admit(BookingDraft {
                    id: Ulid::new(),
                    arena_id: arena,
                    horse_id: Some(horse),
                    requester_id: owner,
                    start: NOW + 26 * HOUR_MS,
                    end: NOW + 27 * HOUR_MS,
                    class: BookingClass::Subscription,
                })
                .await
                .unwrap();
            ids.push(booking.id);
            clock.advance(MINUTE_MS);
        }
        (engine, ids[0], ids[1])
    }

    #[tokio::test]
    async fn reconcile_tick_reports_run() {
        let (engine, first, second) = contested("tick.wal").await;
        let report = reconcile_tick(&engine).await.unwrap();
        assert_eq!(report, ReconcileReport { processed: 2, confirmed: 1 });
        assert!(engine.get_booking(first).await.unwrap().is_confirmed());
        assert!(engine.get_booking(second).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn reconciler_task_promotes_on_its_own() {
        let (engine, first, _) = contested("timer.wal").await;
        let handle = tokio::spawn(run_reconciler(engine.clone(), Duration::from_millis(10)));

        let mut promoted = false;
        for _ in 0..100 {
            if engine.get_booking(first).await.unwrap().is_confirmed() {
                promoted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(promoted, "reconciler never promoted the first booking");
    }

    #[tokio::test]
    async fn compact_if_due_respects_threshold() {
        let (engine, _, _) = contested("compact_threshold.wal").await;
        // Arena, horse, quota and two bookings.
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        assert!(!compact_if_due(&engine, 6).await);
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
