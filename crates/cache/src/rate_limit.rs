//! Redis-backed journey rate counters.
//!
//! Each conditional increment is a single Lua script so that concurrent
//! workers on different nodes never overshoot a cap.

use async_trait::async_trait;
use courier_core::contracts::{Admission, CounterKey, RateLimitStore};
use courier_core::CourierResult;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::client::{store_err, RedisClient};

/// Minute counters outlive their minute by one more for late readers.
const MINUTE_TTL_SECS: u64 = 120;

const INCR_BELOW_CAP: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
current = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return {1, current}
"#;

const SADD_BELOW_CAP: &str = r#"
local size = redis.call('SCARD', KEYS[1])
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return {2, size}
end
if size >= tonumber(ARGV[2]) then
  return {0, size}
end
redis.call('SADD', KEYS[1], ARGV[1])
if tonumber(ARGV[3]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return {1, size + 1}
"#;

const DECR_FLOOR_ZERO: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
  return redis.call('DECR', KEYS[1])
end
return 0
"#;

pub struct RedisRateLimitStore {
    client: RedisClient,
    incr_below_cap: Script,
    sadd_below_cap: Script,
    decr_floor_zero: Script,
}

impl RedisRateLimitStore {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            incr_below_cap: Script::new(INCR_BELOW_CAP),
            sadd_below_cap: Script::new(SADD_BELOW_CAP),
            decr_floor_zero: Script::new(DECR_FLOOR_ZERO),
        }
    }
}

/// Expiry for a distinct-customer set: two windows, so the set outlives its
/// bucket for late readers. 0 keeps a lifetime set forever.
fn distinct_ttl_secs(window_secs: Option<u64>) -> u64 {
    window_secs.map_or(0, |window| window.saturating_mul(2))
}

fn admission(code: i64, current: i64) -> Admission {
    match code {
        1 => Admission::Admitted,
        2 => Admission::AlreadyCounted,
        _ => Admission::Denied {
            current: current.max(0) as u64,
        },
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn check_and_increment(
        &self,
        journey_id: Uuid,
        key: &CounterKey,
        cap: u64,
    ) -> CourierResult<Admission> {
        let mut conn = self.client.conn();
        let (code, current): (i64, i64) = match key {
            CounterKey::PerMinute { bucket } => self
                .incr_below_cap
                .key(self.client.keys().minute_counter(journey_id, *bucket))
                .arg(cap)
                .arg(MINUTE_TTL_SECS)
                .invoke_async(&mut conn)
                .await
                .map_err(store_err)?,
            CounterKey::DistinctCustomers {
                bucket,
                window_secs,
                customer_id,
            } => self
                .sadd_below_cap
                .key(self.client.keys().distinct_set(journey_id, *bucket))
                .arg(customer_id)
                .arg(cap)
                .arg(distinct_ttl_secs(*window_secs))
                .invoke_async(&mut conn)
                .await
                .map_err(store_err)?,
        };
        Ok(admission(code, current))
    }

    async fn peek(&self, journey_id: Uuid, key: &CounterKey) -> CourierResult<u64> {
        let mut conn = self.client.conn();
        let value: Option<u64> = match key {
            CounterKey::PerMinute { bucket } => conn
                .get(self.client.keys().minute_counter(journey_id, *bucket))
                .await
                .map_err(store_err)?,
            CounterKey::DistinctCustomers { bucket, .. } => Some(
                conn.scard(self.client.keys().distinct_set(journey_id, *bucket))
                    .await
                    .map_err(store_err)?,
            ),
        };
        Ok(value.unwrap_or(0))
    }

    async fn release(&self, journey_id: Uuid, key: &CounterKey) -> CourierResult<()> {
        let mut conn = self.client.conn();
        match key {
            CounterKey::PerMinute { bucket } => {
                let _: i64 = self
                    .decr_floor_zero
                    .key(self.client.keys().minute_counter(journey_id, *bucket))
                    .invoke_async(&mut conn)
                    .await
                    .map_err(store_err)?;
            }
            CounterKey::DistinctCustomers {
                bucket,
                customer_id,
                ..
            } => {
                let _: i64 = conn
                    .srem(self.client.keys().distinct_set(journey_id, *bucket), customer_id)
                    .await
                    .map_err(store_err)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_reply_mapping() {
        assert_eq!(admission(1, 3), Admission::Admitted);
        assert_eq!(admission(2, 3), Admission::AlreadyCounted);
        assert_eq!(admission(0, 5), Admission::Denied { current: 5 });
    }

    #[test]
    fn test_distinct_set_expiry_follows_window() {
        assert_eq!(distinct_ttl_secs(None), 0);
        assert_eq!(distinct_ttl_secs(Some(3600)), 7200);
        assert_eq!(distinct_ttl_secs(Some(u64::MAX)), u64::MAX);
    }
}
