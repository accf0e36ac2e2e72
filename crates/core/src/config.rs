use std::collections::HashMap;

use serde::Deserialize;

use crate::types::QueueName;

/// Root application configuration. Loaded from environment variables
/// with the prefix `COURIER__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub queues: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Use Redis for rate counters and locations instead of process memory.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Global mock-send toggle: gate resolves to a synthetic send.
    #[serde(default)]
    pub mock_send: bool,
    /// Diagnostic endpoint pinged on every mock send.
    #[serde(default)]
    pub mock_ping_url: Option<String>,
    /// A lock held longer than this is force-released on the next attempt.
    #[serde(default = "default_lock_max_hold_secs")]
    pub lock_max_hold_secs: u64,
    #[serde(default = "default_catalog_cache_ttl_secs")]
    pub catalog_cache_ttl_secs: u64,
    #[serde(default = "default_catalog_cache_max_entries")]
    pub catalog_cache_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Per-queue overrides keyed by queue name (`message`, `time-delay`, ...).
    #[serde(default)]
    pub concurrency: HashMap<String, usize>,
    #[serde(default = "default_stalled_interval_ms")]
    pub stalled_interval_ms: u64,
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl QueueConfig {
    pub fn concurrency_for(&self, queue: QueueName) -> usize {
        self.concurrency
            .get(queue.as_str())
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "courier".to_string()
}
fn default_lock_max_hold_secs() -> u64 {
    300
}
fn default_catalog_cache_ttl_secs() -> u64 {
    60
}
fn default_catalog_cache_max_entries() -> usize {
    100_000
}
fn default_concurrency() -> usize {
    4
}
fn default_stalled_interval_ms() -> u64 {
    30_000
}
fn default_completed_retention() -> usize {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mock_send: false,
            mock_ping_url: None,
            lock_max_hold_secs: default_lock_max_hold_secs(),
            catalog_cache_ttl_secs: default_catalog_cache_ttl_secs(),
            catalog_cache_max_entries: default_catalog_cache_max_entries(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            concurrency: HashMap::new(),
            stalled_interval_ms: default_stalled_interval_ms(),
            completed_retention: default_completed_retention(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            redis: RedisConfig::default(),
            engine: EngineConfig::default(),
            queues: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("COURIER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(!config.engine.mock_send);
        assert!(!config.redis.enabled);
        assert_eq!(config.queues.max_attempts, 5);
        assert_eq!(config.engine.lock_max_hold_secs, 300);
    }

    #[test]
    fn test_concurrency_override() {
        let mut queues = QueueConfig::default();
        queues.concurrency.insert("message".to_string(), 16);
        queues.concurrency.insert("exit".to_string(), 0);
        assert_eq!(queues.concurrency_for(QueueName::Message), 16);
        assert_eq!(queues.concurrency_for(QueueName::Start), 4);
        assert_eq!(queues.concurrency_for(QueueName::Exit), 1);
    }
}
