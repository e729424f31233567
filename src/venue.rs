use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::jobs;
use crate::limits::*;

/// Per-venue background job settings.
#[derive(Debug, Clone, Copy)]
pub struct VenueOptions {
    /// Compact a venue's WAL after this many appends.
    pub compact_threshold: u64,
    pub reconcile_interval: Duration,
}

impl Default for VenueOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

/// Manages per-venue engines. Each venue gets its own Engine, WAL, reconciler and compactor.
/// Venue = database name from the pgwire connection.
pub struct VenueManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Serializes engine opens so a WAL is never opened twice. Lookups don't take it.
    open_lock: Mutex<()>,
    data_dir: PathBuf,
    options: VenueOptions,
    clock: Arc<dyn Clock>,
}

impl VenueManager {
    /// Venues on the wall clock shifted by `utc_offset_minutes`.
    pub fn new(data_dir: PathBuf, options: VenueOptions, utc_offset_minutes: i64) -> Self {
        Self::with_clock(
            data_dir,
            options,
            Arc::new(SystemClock::new(utc_offset_minutes)),
        )
    }

    pub fn with_clock(data_dir: PathBuf, options: VenueOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            engines: DashMap::new(),
            open_lock: Mutex::new(()),
            data_dir,
            options,
            clock,
        }
    }

    /// Get or lazily open the engine for a venue.
    pub fn get_or_create(&self, venue: &str) -> io::Result<Arc<Engine>> {
        if venue.len() > MAX_VENUE_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "venue name too long",
            ));
        }
        // Only keep characters that are safe in a file name.
        let safe_name: String = venue
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty venue name",
            ));
        }
        if let Some(engine) = self.lookup(&safe_name) {
            return Ok(engine);
        }

        // Replay runs without any map shard locked.
        let _open = self.open_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = self.lookup(&safe_name) {
            return Ok(engine);
        }
        if self.engines.len() >= MAX_VENUES {
            return Err(io::Error::other("too many venues"));
        }
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.clock.clone())?);
        self.spawn_jobs(&engine);
        self.engines.insert(safe_name.clone(), engine.clone());

        metrics::gauge!(crate::observability::VENUES_ACTIVE).set(self.engines.len() as f64);
        info!("venue {safe_name} opened");
        Ok(engine)
    }

    fn lookup(&self, venue: &str) -> Option<Arc<Engine>> {
        self.engines.get(venue).map(|e| e.value().clone())
    }

    fn spawn_jobs(&self, engine: &Arc<Engine>) {
        let reconciler = engine.clone();
        let period = self.options.reconcile_interval;
        tokio::spawn(async move {
            jobs::run_reconciler(reconciler, period).await;
        });
        let compactor = engine.clone();
        let threshold = self.options.compact_threshold;
        tokio::spawn(async move {
            jobs::run_compactor(compactor, threshold).await;
        });
    }
}
