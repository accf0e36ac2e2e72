use chrono::Utc;
use courier_core::types::Journey;
use courier_core::{CourierError, CourierResult};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

/// Live journey definitions and their lifecycle flags.
#[derive(Default)]
pub struct JourneyRegistry {
    journeys: DashMap<Uuid, Journey>,
}

impl JourneyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, journey: Journey) -> Uuid {
        let id = journey.id;
        info!(journey_id = %id, name = %journey.name, "Registering journey");
        self.journeys.insert(id, journey);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Journey> {
        self.journeys.get(&id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<Journey> {
        self.journeys.iter().map(|r| r.value().clone()).collect()
    }

    pub fn pause(&self, id: Uuid) -> CourierResult<Journey> {
        self.update(id, "paused", |j| j.is_paused = true)
    }

    pub fn unpause(&self, id: Uuid) -> CourierResult<Journey> {
        self.update(id, "unpaused", |j| j.is_paused = false)
    }

    /// Stopping is final; jobs that run afterwards finalize their location.
    pub fn stop(&self, id: Uuid) -> CourierResult<Journey> {
        self.update(id, "stopped", |j| j.is_stopped = true)
    }

    /// Unknown journeys count as stopped.
    pub fn is_stopped(&self, id: Uuid) -> bool {
        self.journeys.get(&id).map_or(true, |j| j.is_stopped)
    }

    fn update(&self, id: Uuid, action: &str, apply: impl FnOnce(&mut Journey)) -> CourierResult<Journey> {
        let mut entry = self
            .journeys
            .get_mut(&id)
            .ok_or(CourierError::JourneyNotFound(id))?;
        apply(&mut entry);
        entry.updated_at = Utc::now();
        entry.version += 1;
        info!(journey_id = %id, action, "Journey lifecycle changed");
        Ok(entry.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::types::JourneySettings;

    fn journey() -> Journey {
        let now = Utc::now();
        Journey {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "lifecycle".to_string(),
            steps: vec![],
            settings: JourneySettings::default(),
            is_paused: false,
            is_stopped: false,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_lifecycle_flags() {
        let registry = JourneyRegistry::new();
        let id = registry.register(journey());

        assert!(registry.pause(id).unwrap().is_paused);
        assert!(!registry.unpause(id).unwrap().is_paused);
        assert!(!registry.is_stopped(id));

        let stopped = registry.stop(id).unwrap();
        assert!(stopped.is_stopped);
        assert_eq!(stopped.version, 4);
        assert!(registry.is_stopped(id));
    }

    #[test]
    fn test_unknown_journey() {
        let registry = JourneyRegistry::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            registry.stop(id),
            Err(CourierError::JourneyNotFound(missing)) if missing == id
        ));
        assert!(registry.is_stopped(id));
        assert!(registry.list().is_empty());
    }
}
