use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let arena_id = self
            .get_arena_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let arena = self
            .get_arena(&arena_id)
            .ok_or(EngineError::NotFound(arena_id))?;
        let guard = arena.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings on an arena in any state, ordered by start.
    ///
    /// With a window, only bookings lying entirely inside it are returned.
    pub async fn list_bookings(
        &self,
        arena_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Booking>, EngineError> {
        if let Some(w) = &window
            && w.duration_ms() > MAX_QUERY_WINDOW_MS
        {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let arena = self
            .get_arena(&arena_id)
            .ok_or(EngineError::NotFound(arena_id))?;
        let guard = arena.read().await;
        let bookings = match window {
            Some(w) => guard
                .overlapping(&w)
                .filter(|b| b.span.start >= w.start && b.span.end <= w.end)
                .cloned()
                .collect(),
            None => guard.bookings.clone(),
        };
        Ok(bookings)
    }

    pub async fn list_arenas(&self) -> Vec<ArenaInfo> {
        let arenas: Vec<_> = self.arenas.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(arenas.len());
        for arena in arenas {
            let guard = arena.read().await;
            infos.push(ArenaInfo {
                id: guard.id,
                name: guard.name.clone(),
                active: guard.active,
                confirmed: guard.bookings.iter().filter(|b| b.is_confirmed()).count(),
                pending: guard.bookings.iter().filter(|b| b.is_pending()).count(),
            });
        }
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Holds the registry lock, every arena's read lock and the quota read lock until
    /// the compacted file is swapped in, so no write can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;

        let mut arenas: Vec<_> = self
            .arenas
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        arenas.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(arenas.len());
        for (_, arena) in arenas {
            guards.push(arena.read_owned().await);
        }
        let quota = self.quota.read().await;

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ArenaCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            if !guard.active {
                events.push(Event::ArenaUpdated {
                    id: guard.id,
                    name: guard.name.clone(),
                    active: false,
                });
            }
        }
        for horse in self.horses.iter() {
            events.push(Event::HorseRegistered {
                id: horse.id,
                owner_id: horse.owner_id,
                name: horse.name.clone(),
            });
        }
        for staff in self.staff.iter() {
            events.push(Event::StaffGranted { id: *staff });
        }
        if quota.is_some() {
            events.push(Event::QuotaConfigured { config: *quota });
        }
        for guard in &guards {
            for booking in &guard.bookings {
                events.push(Event::BookingAdmitted {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
