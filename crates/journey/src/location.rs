//! Journey location tracker: where each customer is, and who may move them.
//!
//! A location's lock is owned by a job id. Acquisition goes through
//! [`LocationTracker::acquire`], which hands back a [`LocationLock`] guard that
//! must be consumed by exactly one of `release`, `hand_off` or `finalize`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use courier_core::contracts::LocationStore;
use courier_core::types::{JourneyLocation, LockAttempt, LockState};
use courier_core::{CourierError, CourierResult};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Process-local location store. Each operation runs under the entry's
/// shard lock, which makes the compare-and-set transitions atomic.
#[derive(Default)]
pub struct InMemoryLocationStore {
    locations: DashMap<(Uuid, String), JourneyLocation>,
}

impl InMemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    fn key(customer_id: &str, journey_id: Uuid) -> (Uuid, String) {
        (journey_id, customer_id.to_string())
    }

    /// The location's entry, if `token` owns its lock.
    fn owned(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
    ) -> CourierResult<RefMut<'_, (Uuid, String), JourneyLocation>> {
        match self.locations.get_mut(&Self::key(customer_id, journey_id)) {
            Some(location) if location.is_owned_by(token) => Ok(location),
            Some(_) => Err(not_owner(customer_id, journey_id, token)),
            None => Err(CourierError::Store(format!(
                "location for customer {customer_id} in journey {journey_id} is gone"
            ))),
        }
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    async fn create(&self, location: JourneyLocation) -> CourierResult<bool> {
        let key = Self::key(&location.customer_id, location.journey_id);
        match self.locations.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(location);
                Ok(true)
            }
        }
    }

    async fn get(
        &self,
        customer_id: &str,
        journey_id: Uuid,
    ) -> CourierResult<Option<JourneyLocation>> {
        Ok(self
            .locations
            .get(&Self::key(customer_id, journey_id))
            .map(|l| l.clone()))
    }

    async fn try_lock(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        max_hold: Duration,
    ) -> CourierResult<LockAttempt> {
        let Some(mut location) = self.locations.get_mut(&Self::key(customer_id, journey_id)) else {
            return Ok(LockAttempt::Missing);
        };

        let attempt = match location.lock {
            LockState::Unlocked => LockAttempt::Acquired,
            LockState::Reserved { token: reserved } if reserved == token => LockAttempt::Acquired,
            LockState::Reserved { token: previous } | LockState::Held { token: previous } => {
                let expired = location
                    .locked_at
                    .map_or(true, |locked_at| now - locked_at >= max_hold);
                if !expired {
                    return Ok(LockAttempt::Busy);
                }
                LockAttempt::Reclaimed { previous }
            }
        };
        location.lock = LockState::Held { token };
        location.locked_at = Some(now);
        Ok(attempt)
    }

    async fn unlock(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
    ) -> CourierResult<bool> {
        let Some(mut location) = self.locations.get_mut(&Self::key(customer_id, journey_id)) else {
            return Ok(false);
        };
        match location.lock {
            LockState::Reserved { token: owner } | LockState::Held { token: owner }
                if owner == token =>
            {
                location.lock = LockState::Unlocked;
                location.locked_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hand_off(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        next_token: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<bool> {
        let Some(mut location) = self.locations.get_mut(&Self::key(customer_id, journey_id)) else {
            return Ok(false);
        };
        if location.lock != (LockState::Held { token }) {
            return Ok(false);
        }
        location.lock = LockState::Reserved { token: next_token };
        location.locked_at = Some(now);
        Ok(true)
    }

    async fn move_to(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        step_id: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<()> {
        let mut location = self.owned(customer_id, journey_id, token)?;
        location.current_step_id = step_id;
        location.message_sent = false;
        location.step_entered_at = now;
        Ok(())
    }

    async fn set_message_sent(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
    ) -> CourierResult<()> {
        self.owned(customer_id, journey_id, token)?.message_sent = true;
        Ok(())
    }

    async fn finalize(&self, customer_id: &str, journey_id: Uuid, token: Uuid) -> CourierResult<()> {
        let key = Self::key(customer_id, journey_id);
        match self.locations.entry(key) {
            Entry::Vacant(_) => Ok(()),
            Entry::Occupied(entry) if entry.get().is_owned_by(token) => {
                entry.remove();
                Ok(())
            }
            Entry::Occupied(_) => Err(not_owner(customer_id, journey_id, token)),
        }
    }
}

fn not_owner(customer_id: &str, journey_id: Uuid, token: Uuid) -> CourierError {
    CourierError::Store(format!(
        "lock for customer {customer_id} in journey {journey_id} is not owned by {token}"
    ))
}

/// Outcome of [`LocationTracker::acquire`].
pub enum Acquisition {
    Locked(LocationLock),
    /// Another advancement of this customer is in progress.
    Busy,
    /// The customer has no location in this journey.
    Missing,
}

/// Lock policy over a [`LocationStore`].
#[derive(Clone)]
pub struct LocationTracker {
    store: Arc<dyn LocationStore>,
    max_hold: Duration,
}

impl LocationTracker {
    pub fn new(store: Arc<dyn LocationStore>, max_hold: Duration) -> Self {
        Self { store, max_hold }
    }

    pub fn store(&self) -> &Arc<dyn LocationStore> {
        &self.store
    }

    /// Creates the location for a newly admitted customer.
    pub async fn admit(&self, location: JourneyLocation) -> CourierResult<bool> {
        self.store.create(location).await
    }

    pub async fn get(
        &self,
        customer_id: &str,
        journey_id: Uuid,
    ) -> CourierResult<Option<JourneyLocation>> {
        self.store.get(customer_id, journey_id).await
    }

    /// Takes the lock on behalf of the job `token`.
    pub async fn acquire(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<Acquisition> {
        let attempt = self
            .store
            .try_lock(customer_id, journey_id, token, now, self.max_hold)
            .await?;
        match attempt {
            LockAttempt::Acquired => {}
            LockAttempt::Reclaimed { previous } => {
                warn!(
                    customer_id = %customer_id,
                    journey_id = %journey_id,
                    previous = %previous,
                    token = %token,
                    "Force-released location lock held past maximum hold time"
                );
                metrics::counter!("location.lock.reclaimed").increment(1);
            }
            LockAttempt::Busy => {
                debug!(customer_id = %customer_id, journey_id = %journey_id, token = %token, "Location busy");
                metrics::counter!("location.lock.busy").increment(1);
                return Ok(Acquisition::Busy);
            }
            LockAttempt::Missing => return Ok(Acquisition::Missing),
        }
        Ok(Acquisition::Locked(LocationLock {
            store: self.store.clone(),
            customer_id: customer_id.to_string(),
            journey_id,
            token,
            armed: true,
        }))
    }
}

/// Scoped ownership of one location's lock.
///
/// Dropped while still armed (panic, or the job future cancelled by the
/// stall timeout), the guard releases the lock from a background task.
pub struct LocationLock {
    store: Arc<dyn LocationStore>,
    customer_id: String,
    journey_id: Uuid,
    token: Uuid,
    armed: bool,
}

impl LocationLock {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub async fn current(&self) -> CourierResult<Option<JourneyLocation>> {
        self.store.get(&self.customer_id, self.journey_id).await
    }

    pub async fn move_to(&self, step_id: Uuid, now: DateTime<Utc>) -> CourierResult<()> {
        self.store
            .move_to(&self.customer_id, self.journey_id, self.token, step_id, now)
            .await
    }

    pub async fn set_message_sent(&self) -> CourierResult<()> {
        self.store
            .set_message_sent(&self.customer_id, self.journey_id, self.token)
            .await
    }

    /// Unlocks; the customer stays where they are.
    pub async fn release(mut self) -> CourierResult<()> {
        self.armed = false;
        let released = self
            .store
            .unlock(&self.customer_id, self.journey_id, self.token)
            .await?;
        if !released {
            warn!(
                customer_id = %self.customer_id,
                journey_id = %self.journey_id,
                token = %self.token,
                "Lock was no longer owned at release"
            );
        }
        Ok(())
    }

    /// Reserves the lock for the queued job `next_token`.
    pub async fn hand_off(mut self, next_token: Uuid, now: DateTime<Utc>) -> CourierResult<()> {
        self.armed = false;
        let moved = self
            .store
            .hand_off(&self.customer_id, self.journey_id, self.token, next_token, now)
            .await?;
        if moved {
            Ok(())
        } else {
            Err(CourierError::Store(format!(
                "lock for customer {} in journey {} lost before hand-off",
                self.customer_id, self.journey_id
            )))
        }
    }

    /// Removes the location; the customer has left the journey.
    pub async fn finalize(mut self) -> CourierResult<()> {
        self.armed = false;
        self.store
            .finalize(&self.customer_id, self.journey_id, self.token)
            .await
    }
}

impl Drop for LocationLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            customer_id = %self.customer_id,
            journey_id = %self.journey_id,
            token = %self.token,
            "Location lock dropped while held, releasing in background"
        );
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(customer_id = %self.customer_id, "No runtime to release dropped lock");
            return;
        };
        let store = self.store.clone();
        let customer_id = std::mem::take(&mut self.customer_id);
        let journey_id = self.journey_id;
        let token = self.token;
        runtime.spawn(async move {
            if let Err(e) = store.unlock(&customer_id, journey_id, token).await {
                error!(customer_id = %customer_id, journey_id = %journey_id, error = %e, "Background lock release failed");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tracker() -> (Arc<InMemoryLocationStore>, LocationTracker) {
        let store = Arc::new(InMemoryLocationStore::new());
        (store.clone(), LocationTracker::new(store, Duration::seconds(300)))
    }

    async fn seeded(store: &InMemoryLocationStore, now: DateTime<Utc>) -> JourneyLocation {
        let location = JourneyLocation::new("c-1", Uuid::new_v4(), Uuid::new_v4(), now);
        assert!(store.create(location.clone()).await.unwrap());
        assert!(!store.create(location.clone()).await.unwrap());
        location
    }

    fn locked(acquisition: Acquisition) -> LocationLock {
        match acquisition {
            Acquisition::Locked(lock) => lock,
            Acquisition::Busy => panic!("expected lock, got busy"),
            Acquisition::Missing => panic!("expected lock, got missing"),
        }
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_release() {
        let (store, tracker) = tracker();
        let now = Utc::now();
        let loc = seeded(&store, now).await;

        let first = locked(tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap());
        assert!(matches!(
            tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap(),
            Acquisition::Busy
        ));

        first.release().await.unwrap();
        assert!(matches!(
            tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap(),
            Acquisition::Locked(_)
        ));
    }

    #[tokio::test]
    async fn test_hand_off_reserves_for_next_token_only() {
        let (store, tracker) = tracker();
        let now = Utc::now();
        let loc = seeded(&store, now).await;
        let next = Uuid::new_v4();

        let lock = locked(tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap());
        lock.hand_off(next, now).await.unwrap();

        assert!(matches!(
            tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap(),
            Acquisition::Busy
        ));
        let claimed = locked(tracker.acquire("c-1", loc.journey_id, next, now).await.unwrap());
        // A second delivery of the same job sees the lock held.
        assert!(matches!(
            tracker.acquire("c-1", loc.journey_id, next, now).await.unwrap(),
            Acquisition::Busy
        ));
        claimed.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let (store, _tracker) = tracker();
        let now = Utc::now();
        let loc = seeded(&store, now).await;
        let stale = Uuid::new_v4();

        let attempt = store
            .try_lock("c-1", loc.journey_id, stale, now, Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(attempt, LockAttempt::Acquired);

        let later = now + Duration::seconds(301);
        let fresh = Uuid::new_v4();
        assert_eq!(
            store
                .try_lock("c-1", loc.journey_id, fresh, later, Duration::seconds(300))
                .await
                .unwrap(),
            LockAttempt::Reclaimed { previous: stale }
        );
        // The old owner can no longer unlock.
        assert!(!store.unlock("c-1", loc.journey_id, stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (store, tracker) = tracker();
        let now = Utc::now();
        let loc = seeded(&store, now).await;

        let lock = locked(tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap());
        drop(lock);

        for _ in 0..50 {
            if !store.get("c-1", loc.journey_id).await.unwrap().unwrap().is_locked() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped lock was never released");
    }

    #[tokio::test]
    async fn test_finalize_and_missing() {
        let (store, tracker) = tracker();
        let now = Utc::now();
        let loc = seeded(&store, now).await;

        let lock = locked(tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap());
        lock.move_to(Uuid::new_v4(), now).await.unwrap();
        lock.finalize().await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap(),
            Acquisition::Missing
        ));
    }

    #[tokio::test]
    async fn test_reclaimed_lock_blocks_writes_from_previous_owner() {
        let (store, tracker) = tracker();
        let now = Utc::now();
        let loc = seeded(&store, now).await;

        let stale = locked(tracker.acquire("c-1", loc.journey_id, Uuid::new_v4(), now).await.unwrap());
        let later = now + Duration::seconds(301);
        let fresh_token = Uuid::new_v4();
        let fresh = locked(tracker.acquire("c-1", loc.journey_id, fresh_token, later).await.unwrap());

        let err = stale.move_to(Uuid::new_v4(), later).await.unwrap_err();
        assert!(matches!(err, CourierError::Store(_)));
        assert!(stale.set_message_sent().await.is_err());
        assert!(stale.finalize().await.is_err());

        let current = store.get("c-1", loc.journey_id).await.unwrap().unwrap();
        assert_eq!(current.current_step_id, loc.current_step_id);
        assert!(!current.message_sent);
        assert_eq!(current.lock, LockState::Held { token: fresh_token });

        fresh.move_to(Uuid::new_v4(), later).await.unwrap();
        fresh.finalize().await.unwrap();
        assert!(store.is_empty());
    }
}
