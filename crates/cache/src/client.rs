//! Redis connection shared by the counter and location stores.

use courier_core::config::RedisConfig;
use courier_core::CourierError;
use redis::aio::ConnectionManager;
use tracing::info;
use uuid::Uuid;

/// Auto-reconnecting Redis connection plus the key namespace.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
    keys: KeySpace,
}

impl RedisClient {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            keys: KeySpace::new(&config.key_prefix),
        })
    }

    /// A cheap handle; `ConnectionManager` multiplexes over one socket.
    pub fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }
}

/// Builds every key the engine writes, under one prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    pub fn location(&self, journey_id: Uuid, customer_id: &str) -> String {
        format!("{}:location:{journey_id}:{customer_id}", self.prefix)
    }

    pub fn minute_counter(&self, journey_id: Uuid, bucket: i64) -> String {
        format!("{}:rate:{journey_id}:minute:{bucket}", self.prefix)
    }

    pub fn distinct_set(&self, journey_id: Uuid, bucket: i64) -> String {
        format!("{}:rate:{journey_id}:distinct:{bucket}", self.prefix)
    }
}

pub(crate) fn store_err(e: redis::RedisError) -> CourierError {
    CourierError::Store(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("courier:");
        let journey = Uuid::nil();
        assert_eq!(
            keys.location(journey, "c-1"),
            "courier:location:00000000-0000-0000-0000-000000000000:c-1"
        );
        assert_eq!(
            keys.minute_counter(journey, 7),
            "courier:rate:00000000-0000-0000-0000-000000000000:minute:7"
        );
        assert!(keys.distinct_set(journey, 0).ends_with(":distinct:0"));
    }
}
