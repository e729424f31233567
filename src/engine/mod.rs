mod admission;
mod conflict;
mod error;
mod queries;
pub mod quota;
mod reconcile;
mod registry;

pub use error::{EngineError, ErrorKind};
pub use reconcile::default_horizon;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

pub type SharedArenaState = Arc<RwLock<ArenaState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Lookup tables derived from arena state; rebuilt on replay.
#[derive(Default)]
pub(super) struct Indexes {
    /// booking id → arena id
    booking_to_arena: DashMap<Ulid, Ulid>,
    /// horse id → (booking id → span) of its confirmed bookings on every arena
    horse_ledger: DashMap<Ulid, HashMap<Ulid, Span>>,
}

impl Indexes {
    fn track_confirmed(&self, booking: &Booking) {
        let Some(horse_id) = booking.horse_id else { return };
        if booking.is_confirmed() {
            self.horse_ledger
                .entry(horse_id)
                .or_default()
                .insert(booking.id, booking.span);
        } else if let Some(mut ledger) = self.horse_ledger.get_mut(&horse_id) {
            ledger.remove(&booking.id);
        }
    }
}

/// A booking id held in `booking_to_arena` while its admission is decided.
/// Released on drop unless the admission was persisted.
pub(super) struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    kept: bool,
}

impl IdClaim<'_> {
    pub(super) fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.index.remove(&self.id);
        }
    }
}

pub struct Engine {
    pub(super) arenas: DashMap<Ulid, SharedArenaState>,
    pub(super) horses: DashMap<Ulid, Horse>,
    pub(super) staff: DashSet<Ulid>,
    pub(super) quota: RwLock<Option<QuotaConfig>>,
    pub(super) indexes: Indexes,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes reconciliation runs.
    pub(super) reconcile_lock: Mutex<()>,
    /// Serializes registry writes (arenas, horses, staff) against each other and compaction.
    pub(super) registry_lock: Mutex<()>,
    /// Next `Booking::seq`.
    admit_seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// Apply a booking or arena event to an arena. Caller holds the write lock.
fn apply_to_arena(arena: &mut ArenaState, event: &Event, indexes: &Indexes) {
    match event {
        Event::BookingAdmitted { booking } => {
            indexes.booking_to_arena.insert(booking.id, booking.arena_id);
            indexes.track_confirmed(booking);
            arena.insert_booking(booking.clone());
        }
        Event::BookingRescheduled {
            id, span, state, ..
        } => {
            if let Some(mut booking) = arena.remove_booking(*id) {
                booking.span = *span;
                booking.state = *state;
                indexes.track_confirmed(&booking);
                arena.insert_booking(booking);
            }
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(booking) = arena.booking_mut(*id) {
                booking.state = BookingState::Confirmed;
                indexes.track_confirmed(booking);
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(booking) = arena.booking_mut(*id) {
                booking.state = BookingState::Cancelled;
                indexes.track_confirmed(booking);
            }
        }
        Event::ArenaUpdated { name, active, .. } => {
            arena.name = name.clone();
            arena.active = *active;
        }
        // Registry events are applied at the engine level, not here.
        Event::ArenaCreated { .. }
        | Event::HorseRegistered { .. }
        | Event::HorseRemoved { .. }
        | Event::StaffGranted { .. }
        | Event::StaffRevoked { .. }
        | Event::QuotaConfigured { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            arenas: DashMap::new(),
            horses: DashMap::new(),
            staff: DashSet::new(),
            quota: RwLock::new(None),
            indexes: Indexes::default(),
            wal_tx,
            reconcile_lock: Mutex::new(()),
            registry_lock: Mutex::new(()),
            admit_seq: AtomicU64::new(0),
            clock,
        };

        // We're the sole owner of every lock during replay, so try_read/try_write
        // always succeed. Never block here: this may run inside an async context
        // (lazy venue creation).
        for event in &events {
            engine.apply_replayed(event);
        }
        if !events.is_empty() {
            tracing::debug!("replayed {} WAL events", events.len());
        }

        Ok(engine)
    }

    fn apply_replayed(&self, event: &Event) {
        match event {
            Event::QuotaConfigured { config } => {
                *self.quota.try_write().expect("replay: uncontended write") = *config;
            }
            Event::ArenaUpdated { id, .. } => {
                if let Some(arena) = self.get_arena(id) {
                    let mut guard = arena.try_write().expect("replay: uncontended write");
                    apply_to_arena(&mut guard, event, &self.indexes);
                }
            }
            Event::BookingAdmitted { booking } => {
                self.admit_seq.fetch_max(booking.seq + 1, Ordering::Relaxed);
                if let Some(arena) = self.get_arena(&booking.arena_id) {
                    let mut guard = arena.try_write().expect("replay: uncontended write");
                    apply_to_arena(&mut guard, event, &self.indexes);
                }
            }
            other => match other.booking_arena() {
                Some(arena_id) => {
                    if let Some(arena) = self.get_arena(&arena_id) {
                        let mut guard = arena.try_write().expect("replay: uncontended write");
                        apply_to_arena(&mut guard, other, &self.indexes);
                    }
                }
                None => self.apply_registry_event(other),
            },
        }
    }

    /// Registry changes that don't touch an arena's booking list.
    fn apply_registry_event(&self, event: &Event) {
        match event {
            Event::ArenaCreated { id, name } => {
                let arena = ArenaState::new(*id, name.clone());
                self.arenas.insert(*id, Arc::new(RwLock::new(arena)));
            }
            Event::HorseRegistered { id, owner_id, name } => {
                self.horses.insert(
                    *id,
                    Horse {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                    },
                );
            }
            Event::HorseRemoved { id } => {
                self.horses.remove(id);
            }
            Event::StaffGranted { id } => {
                self.staff.insert(*id);
            }
            Event::StaffRevoked { id } => {
                self.staff.remove(id);
            }
            _ => {}
        }
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, for events scoped to one arena.
    pub(super) async fn persist_and_apply(
        &self,
        arena: &mut ArenaState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_arena(arena, event, &self.indexes);
        Ok(())
    }

    /// WAL-append then apply, for registry events.
    pub(super) async fn persist_registry(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_registry_event(&event);
        Ok(())
    }

    /// Reserve a booking id for an admission into `arena_id`. Fails if the id is taken
    /// or another admission already holds it.
    pub(super) fn claim_booking_id(
        &self,
        id: Ulid,
        arena_id: Ulid,
    ) -> Result<IdClaim<'_>, EngineError> {
        match self.indexes.booking_to_arena.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(arena_id);
                Ok(IdClaim {
                    index: &self.indexes.booking_to_arena,
                    id,
                    kept: false,
                })
            }
        }
    }

    /// Stamp for the next admitted booking.
    pub(super) fn next_admit_seq(&self) -> u64 {
        self.admit_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get_arena(&self, id: &Ulid) -> Option<SharedArenaState> {
        self.arenas.get(id).map(|e| e.value().clone())
    }

    pub fn get_arena_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.indexes
            .booking_to_arena
            .get(booking_id)
            .map(|e| *e.value())
    }

    /// Lookup booking → arena, acquire the arena's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ArenaState>), EngineError> {
        let arena_id = self
            .get_arena_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let arena = self
            .get_arena(&arena_id)
            .ok_or(EngineError::NotFound(arena_id))?;
        let guard = arena.write_owned().await;
        Ok((arena_id, guard))
    }

    /// Quota configuration snapshot for one admission decision.
    pub async fn quota_config(&self) -> Option<QuotaConfig> {
        *self.quota.read().await
    }
}
