#![warn(clippy::unwrap_used)]

pub mod catalog;
pub mod client;
pub mod local;
pub mod location;
pub mod rate_limit;

pub use catalog::CachedCatalog;
pub use client::{KeySpace, RedisClient};
pub use local::LocalCache;
pub use location::RedisLocationStore;
pub use rate_limit::RedisRateLimitStore;
