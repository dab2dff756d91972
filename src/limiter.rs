//! Per-tenant QPS and concurrency admission on the Cache port.
//!
//! The QPS gate is a per-second bucket keyed by `(tenant, wall-second)`; the
//! concurrency gate is a tenant-scoped counter whose decrement is owned by a
//! guard so every exit path, including panics downstream, releases the slot.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, CacheError};
use crate::store::Tenant;
use crate::util::now_epoch_secs;

pub const DEFAULT_QPS: u32 = 10;
pub const DEFAULT_CONCURRENCY: u32 = 5;

const QPS_BUCKET_TTL: Duration = Duration::from_secs(2);
// The TTL backstops a decrement that never runs (process kill, no runtime).
const CONCURRENCY_TTL: Duration = Duration::from_secs(60);

pub struct Limiter {
    cache: Arc<dyn Cache>,
    qps: u32,
    concurrency: u32,
}

impl Limiter {
    pub fn new(cache: Arc<dyn Cache>, qps: u32, concurrency: u32) -> Self {
        Self {
            cache,
            qps: qps.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Per-second admission. A tenant-level RPM limit, when set, overrides
    /// the configured default budget.
    pub async fn allow_qps(&self, tenant: &Tenant) -> Result<bool, CacheError> {
        let budget = if tenant.rate_limit_rpm > 0 {
            (tenant.rate_limit_rpm / 60).max(1)
        } else {
            self.qps
        };
        let key = format!("qps:{}:{}", tenant.id, now_epoch_secs());
        let count = self.cache.incr(&key, QPS_BUCKET_TTL).await?;
        Ok(count <= i64::from(budget))
    }

    /// Acquires a concurrency slot, or returns `None` when the tenant is at
    /// its limit. The increment is rolled back before rejecting.
    pub async fn acquire(&self, tenant_id: &str) -> Result<Option<ConcurrencyGuard>, CacheError> {
        let key = format!("conc:{tenant_id}");
        let in_flight = self.cache.incr(&key, CONCURRENCY_TTL).await?;
        if in_flight > i64::from(self.concurrency) {
            let _ = self.cache.decr(&key).await;
            return Ok(None);
        }
        Ok(Some(ConcurrencyGuard {
            cache: Arc::clone(&self.cache),
            key: Some(key),
        }))
    }
}

/// Holds one concurrency slot; dropping it releases the slot.
pub struct ConcurrencyGuard {
    cache: Arc<dyn Cache>,
    key: Option<String>,
}

impl ConcurrencyGuard {
    /// Explicit release on the happy path, so the decrement is awaited
    /// rather than spawned.
    pub async fn release(mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.cache.decr(&key).await;
        }
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = cache.decr(&key).await;
            });
        }
    }
}
