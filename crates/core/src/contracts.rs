//! Collaborator contracts consumed by the engine.
//!
//! Everything the dispatcher touches outside its own memory goes through one
//! of these traits, so the engine can run against fakes in tests and against
//! Redis or provider integrations in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CourierResult, SendFault};
use crate::types::{
    Channel, DeliveryReceipt, JourneyLocation, LockAttempt, QueuePayload, RenderedMessage, Step,
    Template,
};

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Step>>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> CourierResult<Option<Template>>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        content: &RenderedMessage,
        destination: &str,
    ) -> Result<DeliveryReceipt, SendFault>;
}

/// Which journey counter an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// Sends in the minute starting at `bucket * 60` seconds since the epoch.
    PerMinute { bucket: i64 },
    /// Distinct customers messaged in the given window bucket. `window_secs`
    /// is the bucket width; `None` means one bucket for the journey's lifetime.
    DistinctCustomers {
        bucket: i64,
        window_secs: Option<u64>,
        customer_id: String,
    },
}

/// Outcome of an atomic conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The customer is already a member of the distinct set; nothing was incremented.
    AlreadyCounted,
    Denied { current: u64 },
}

/// Shared, contended per-journey rate counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically increments the counter unless it already reached `cap`.
    async fn check_and_increment(
        &self,
        journey_id: Uuid,
        key: &CounterKey,
        cap: u64,
    ) -> CourierResult<Admission>;

    /// Current value without modifying it.
    async fn peek(&self, journey_id: Uuid, key: &CounterKey) -> CourierResult<u64>;

    /// Returns a previously admitted increment.
    async fn release(&self, journey_id: Uuid, key: &CounterKey) -> CourierResult<()>;
}

/// Persistence for journey locations and their locks.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Inserts a new location; returns `false` if one already exists.
    async fn create(&self, location: JourneyLocation) -> CourierResult<bool>;

    async fn get(&self, customer_id: &str, journey_id: Uuid)
        -> CourierResult<Option<JourneyLocation>>;

    async fn try_lock(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        now: DateTime<Utc>,
        max_hold: chrono::Duration,
    ) -> CourierResult<LockAttempt>;

    /// Releases the lock if `token` owns it; returns whether it did.
    async fn unlock(&self, customer_id: &str, journey_id: Uuid, token: Uuid)
        -> CourierResult<bool>;

    /// Moves a lock held by `token` to `next_token`, reserved for the job
    /// carrying it. Returns `false` when `token` does not hold the lock.
    async fn hand_off(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        next_token: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<bool>;

    /// Positions the customer at `step_id` and clears `message_sent`.
    ///
    /// This method, `set_message_sent` and `finalize` only write while `token`
    /// owns the lock; otherwise they fail with a `Store` error.
    async fn move_to(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
        step_id: Uuid,
        now: DateTime<Utc>,
    ) -> CourierResult<()>;

    async fn set_message_sent(
        &self,
        customer_id: &str,
        journey_id: Uuid,
        token: Uuid,
    ) -> CourierResult<()>;

    /// Removes the location; the customer has left the journey. A location
    /// that is already gone is not an error.
    async fn finalize(&self, customer_id: &str, journey_id: Uuid, token: Uuid)
        -> CourierResult<()>;
}

/// Durable job queue abstraction; the target queue is derived from the payload.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        payload: QueuePayload,
        delay: Option<std::time::Duration>,
    ) -> CourierResult<()>;
}
