use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{Cache, CacheError};

/// Redis-backed cache for multi-replica deployments; counters are shared so
/// QPS and concurrency limits hold across gateway instances.
#[derive(Clone, Debug)]
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, CacheError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        let value: i64 = conn.decr(key, 1).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }
}
