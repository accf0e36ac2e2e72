//! Journey rate limiting: per-minute send cap and distinct-customers-messaged cap.
//!
//! Both checks are atomic conditional increments against a shared
//! `RateLimitStore`. An increment that does not end in a send is refunded
//! through the returned `Reservation`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use courier_core::contracts::{Admission, CounterKey, RateLimitStore};
use courier_core::types::{DistinctLimitConfig, Journey};
use courier_core::CourierResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Counters incremented on behalf of one send attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    pub keys: Vec<CounterKey>,
}

impl Reservation {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Outcome of one limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitCheck {
    /// Disabled, already counted, or admitted; `reserved` is set when a counter moved.
    Allowed { reserved: Option<CounterKey> },
    Exceeded { current: u64, max: u64 },
}

/// Check-only snapshot of a journey's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateUsage {
    pub journey_id: Uuid,
    pub sent_this_minute: u64,
    pub customers_messaged: u64,
}

/// Journey-level limiter over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Admits `customer_id` into the journey's distinct-customers set unless the cap is reached.
    pub async fn admit_customer(
        &self,
        journey: &Journey,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> CourierResult<LimitCheck> {
        let limit = &journey.settings.max_customers_messaged;
        if !limit.enabled {
            return Ok(LimitCheck::Allowed { reserved: None });
        }
        let key = distinct_key(limit, customer_id, now);
        match self
            .store
            .check_and_increment(journey.id, &key, limit.max)
            .await?
        {
            Admission::Admitted => Ok(LimitCheck::Allowed {
                reserved: Some(key),
            }),
            Admission::AlreadyCounted => Ok(LimitCheck::Allowed { reserved: None }),
            Admission::Denied { current } => Ok(LimitCheck::Exceeded {
                current,
                max: limit.max,
            }),
        }
    }

    /// Takes one slot of the current minute's send budget.
    pub async fn admit_send(
        &self,
        journey: &Journey,
        now: DateTime<Utc>,
    ) -> CourierResult<LimitCheck> {
        let limit = &journey.settings.max_messages_per_minute;
        if !limit.enabled {
            return Ok(LimitCheck::Allowed { reserved: None });
        }
        let key = minute_key(now);
        match self
            .store
            .check_and_increment(journey.id, &key, limit.max)
            .await?
        {
            Admission::Admitted | Admission::AlreadyCounted => Ok(LimitCheck::Allowed {
                reserved: Some(key),
            }),
            Admission::Denied { current } => Ok(LimitCheck::Exceeded {
                current,
                max: limit.max,
            }),
        }
    }

    /// Returns every counter taken by `reservation`.
    pub async fn refund(&self, journey_id: Uuid, reservation: &Reservation) {
        for key in &reservation.keys {
            if let Err(e) = self.store.release(journey_id, key).await {
                warn!(journey_id = %journey_id, error = %e, ?key, "Failed to refund rate counter");
            } else {
                debug!(journey_id = %journey_id, ?key, "Rate counter refunded");
            }
        }
    }

    /// Reads both counters without modifying them.
    pub async fn usage(&self, journey: &Journey, now: DateTime<Utc>) -> CourierResult<RateUsage> {
        let sent_this_minute = self.store.peek(journey.id, &minute_key(now)).await?;
        let customers_messaged = self
            .store
            .peek(
                journey.id,
                &distinct_key(&journey.settings.max_customers_messaged, "", now),
            )
            .await?;
        Ok(RateUsage {
            journey_id: journey.id,
            sent_this_minute,
            customers_messaged,
        })
    }
}

pub fn minute_key(now: DateTime<Utc>) -> CounterKey {
    CounterKey::PerMinute {
        bucket: now.timestamp().div_euclid(60),
    }
}

pub fn distinct_key(limit: &DistinctLimitConfig, customer_id: &str, now: DateTime<Utc>) -> CounterKey {
    let window_secs = limit.window_secs.filter(|window| *window > 0);
    let bucket = match window_secs {
        Some(window) => now.timestamp().div_euclid(window as i64),
        None => 0,
    };
    CounterKey::DistinctCustomers {
        bucket,
        window_secs,
        customer_id: customer_id.to_string(),
    }
}

/// Start of the minute following `now`.
pub fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_nanosecond(0).unwrap_or(now) + Duration::seconds(60 - now.second() as i64)
}

/// In-memory counter store backed by DashMap; entry locks make each
/// conditional increment atomic.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    minute_counts: DashMap<(Uuid, i64), u64>,
    distinct: DashMap<(Uuid, i64), HashSet<String>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune_minutes(&self, journey_id: Uuid, bucket: i64) {
        self.minute_counts
            .retain(|(journey, b), _| *journey != journey_id || *b >= bucket - 1);
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_and_increment(
        &self,
        journey_id: Uuid,
        key: &CounterKey,
        cap: u64,
    ) -> CourierResult<Admission> {
        match key {
            CounterKey::PerMinute { bucket } => {
                if !self.minute_counts.contains_key(&(journey_id, *bucket)) {
                    self.prune_minutes(journey_id, *bucket);
                }
                let mut count = self.minute_counts.entry((journey_id, *bucket)).or_insert(0);
                if *count >= cap {
                    return Ok(Admission::Denied { current: *count });
                }
                *count += 1;
                Ok(Admission::Admitted)
            }
            CounterKey::DistinctCustomers {
                bucket,
                customer_id,
                ..
            } => {
                let mut members = self.distinct.entry((journey_id, *bucket)).or_default();
                if members.contains(customer_id) {
                    return Ok(Admission::AlreadyCounted);
                }
                if members.len() as u64 >= cap {
                    return Ok(Admission::Denied {
                        current: members.len() as u64,
                    });
                }
                members.insert(customer_id.clone());
                Ok(Admission::Admitted)
            }
        }
    }

    async fn peek(&self, journey_id: Uuid, key: &CounterKey) -> CourierResult<u64> {
        Ok(match key {
            CounterKey::PerMinute { bucket } => self
                .minute_counts
                .get(&(journey_id, *bucket))
                .map(|c| *c)
                .unwrap_or(0),
            CounterKey::DistinctCustomers { bucket, .. } => self
                .distinct
                .get(&(journey_id, *bucket))
                .map(|m| m.len() as u64)
                .unwrap_or(0),
        })
    }

    async fn release(&self, journey_id: Uuid, key: &CounterKey) -> CourierResult<()> {
        match key {
            CounterKey::PerMinute { bucket } => {
                if let Some(mut count) = self.minute_counts.get_mut(&(journey_id, *bucket)) {
                    *count = count.saturating_sub(1);
                }
            }
            CounterKey::DistinctCustomers {
                bucket,
                customer_id,
                ..
            } => {
                if let Some(mut members) = self.distinct.get_mut(&(journey_id, *bucket)) {
                    members.remove(customer_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use courier_core::types::{JourneySettings, RateLimitConfig};

    fn journey(per_minute: Option<u64>, distinct: Option<u64>) -> Journey {
        let now = Utc::now();
        Journey {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "limits".to_string(),
            steps: vec![],
            settings: JourneySettings {
                max_messages_per_minute: RateLimitConfig {
                    enabled: per_minute.is_some(),
                    max: per_minute.unwrap_or(0),
                },
                max_customers_messaged: DistinctLimitConfig {
                    enabled: distinct.is_some(),
                    max: distinct.unwrap_or(0),
                    window_secs: None,
                },
                ..Default::default()
            },
            is_paused: false,
            is_stopped: false,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_per_minute_cap() {
        let limiter = RateLimiter::new(Arc::new(InMemoryRateLimitStore::new()));
        let journey = journey(Some(2), None);
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 5).unwrap();

        for _ in 0..2 {
            let check = limiter.admit_send(&journey, now).await.unwrap();
            assert!(matches!(check, LimitCheck::Allowed { reserved: Some(_) }));
        }
        assert_eq!(
            limiter.admit_send(&journey, now).await.unwrap(),
            LimitCheck::Exceeded { current: 2, max: 2 }
        );

        // A new minute has a fresh budget.
        let later = now + Duration::seconds(60);
        assert!(matches!(
            limiter.admit_send(&journey, later).await.unwrap(),
            LimitCheck::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_distinct_customers_cap_counts_each_customer_once() {
        let limiter = RateLimiter::new(Arc::new(InMemoryRateLimitStore::new()));
        let journey = journey(None, Some(1));
        let now = Utc::now();

        assert!(matches!(
            limiter.admit_customer(&journey, "a", now).await.unwrap(),
            LimitCheck::Allowed { reserved: Some(_) }
        ));
        assert_eq!(
            limiter.admit_customer(&journey, "a", now).await.unwrap(),
            LimitCheck::Allowed { reserved: None }
        );
        assert_eq!(
            limiter.admit_customer(&journey, "b", now).await.unwrap(),
            LimitCheck::Exceeded { current: 1, max: 1 }
        );
    }

    #[tokio::test]
    async fn test_refund_frees_slot() {
        let limiter = RateLimiter::new(Arc::new(InMemoryRateLimitStore::new()));
        let journey = journey(Some(1), Some(1));
        let now = Utc::now();

        let mut reservation = Reservation::default();
        if let LimitCheck::Allowed { reserved: Some(key) } =
            limiter.admit_customer(&journey, "a", now).await.unwrap()
        {
            reservation.keys.push(key);
        }
        if let LimitCheck::Allowed { reserved: Some(key) } =
            limiter.admit_send(&journey, now).await.unwrap()
        {
            reservation.keys.push(key);
        }
        assert_eq!(reservation.keys.len(), 2);

        let usage = limiter.usage(&journey, now).await.unwrap();
        assert_eq!(usage.sent_this_minute, 1);
        assert_eq!(usage.customers_messaged, 1);

        limiter.refund(journey.id, &reservation).await;
        let usage = limiter.usage(&journey, now).await.unwrap();
        assert_eq!(usage.sent_this_minute, 0);
        assert_eq!(usage.customers_messaged, 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_exceed_cap() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let journey_id = Uuid::new_v4();
        let key = CounterKey::PerMinute { bucket: 42 };

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.check_and_increment(journey_id, &key, 10).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(store.peek(journey_id, &key).await.unwrap(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_customers_never_exceed_cap() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let journey_id = Uuid::new_v4();
        let limit = DistinctLimitConfig {
            enabled: true,
            max: 10,
            window_secs: None,
        };
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            let key = distinct_key(&limit, &format!("c-{i}"), now);
            handles.push(tokio::spawn(async move {
                store.check_and_increment(journey_id, &key, 10).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Admission::Admitted => admitted += 1,
                Admission::Denied { current } => assert_eq!(current, 10),
                Admission::AlreadyCounted => panic!("customers are distinct"),
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(
            store
                .peek(journey_id, &distinct_key(&limit, "", now))
                .await
                .unwrap(),
            10
        );
    }

    #[test]
    fn test_distinct_key_carries_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 42).unwrap();
        let hourly = DistinctLimitConfig {
            enabled: true,
            max: 1,
            window_secs: Some(3600),
        };
        assert_eq!(
            distinct_key(&hourly, "a", now),
            CounterKey::DistinctCustomers {
                bucket: now.timestamp() / 3600,
                window_secs: Some(3600),
                customer_id: "a".to_string(),
            }
        );

        let zero = DistinctLimitConfig {
            window_secs: Some(0),
            ..hourly
        };
        assert!(matches!(
            distinct_key(&zero, "a", now),
            CounterKey::DistinctCustomers { bucket: 0, window_secs: None, .. }
        ));
    }

    #[test]
    fn test_next_minute_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 42).unwrap();
        assert_eq!(
            next_minute(now),
            Utc.with_ymd_and_hms(2024, 3, 14, 10, 1, 0).unwrap()
        );
    }
}
