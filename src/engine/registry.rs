use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    /// Create an arena, or reactivate (and rename) an existing one.
    pub async fn create_arena(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        check_name(&name)?;
        let _registry = self.registry_lock.lock().await;
        if let Some(arena) = self.get_arena(&id) {
            let mut guard = arena.write().await;
            let event = Event::ArenaUpdated {
                id,
                name: name.or_else(|| guard.name.clone()),
                active: true,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!("arena {id} reactivated");
            return Ok(());
        }
        if self.arenas.len() >= MAX_ARENAS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many arenas"));
        }
        self.persist_registry(Event::ArenaCreated { id, name }).await?;
        info!("arena {id} created");
        Ok(())
    }

    /// Stop accepting new bookings on an arena. Existing bookings are kept.
    pub async fn deactivate_arena(&self, id: Ulid) -> Result<(), EngineError> {
        let arena = self.get_arena(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = arena.write().await;
        if !guard.active {
            return Ok(());
        }
        let event = Event::ArenaUpdated {
            id,
            name: guard.name.clone(),
            active: false,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("arena {id} deactivated");
        Ok(())
    }

    /// Register a horse, or transfer it to a new owner.
    pub async fn register_horse(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        let _registry = self.registry_lock.lock().await;
        if !self.horses.contains_key(&id) && self.horses.len() >= MAX_HORSES_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many horses"));
        }
        self.persist_registry(Event::HorseRegistered { id, owner_id, name })
            .await
    }

    pub async fn remove_horse(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if !self.horses.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_registry(Event::HorseRemoved { id }).await
    }

    pub async fn grant_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if self.staff.contains(&id) {
            return Ok(());
        }
        if self.staff.len() >= MAX_STAFF_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        self.persist_registry(Event::StaffGranted { id }).await
    }

    pub async fn revoke_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if !self.staff.contains(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_registry(Event::StaffRevoked { id }).await
    }

    pub fn is_staff(&self, id: &Ulid) -> bool {
        self.staff.contains(id)
    }

    pub fn horse(&self, id: &Ulid) -> Option<Horse> {
        self.horses.get(id).map(|h| h.value().clone())
    }

    /// Replace the venue quota configuration. `None` turns every rule off.
    pub async fn set_quota_config(&self, config: Option<QuotaConfig>) -> Result<(), EngineError> {
        if let Some(c) = &config {
            let durations = [
                c.max_booking_duration,
                c.min_advance_notice,
                c.max_future_total,
                c.max_daily_total,
                c.max_weekly_total,
            ];
            if durations.iter().flatten().any(|d| *d < 0) {
                return Err(EngineError::LimitExceeded("negative quota duration"));
            }
        }
        let mut guard = self.quota.write().await;
        self.wal_append(&Event::QuotaConfigured { config }).await?;
        *guard = config;
        info!("quota configuration updated: {config:?}");
        Ok(())
    }
}
