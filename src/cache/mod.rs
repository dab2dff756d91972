//! Volatile counter/flag storage used by the admission gate and the router
//! health writes. No durability expectation; a restart simply empties it.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use self::redis::RedisCache;
pub use memory::MemoryCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Atomically increments `key` and refreshes its TTL, returning the new
    /// value. A missing key starts at zero.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError>;

    /// Atomically decrements `key`, returning the new value.
    async fn decr(&self, key: &str) -> Result<i64, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}
