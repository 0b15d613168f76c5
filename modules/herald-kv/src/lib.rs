//! Key-value adapter. The only durable store the pipeline coordinates
//! through: get, put with optional TTL, delete, and prefix listing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

mod memory;
mod pg;

pub use memory::MemoryKv;
pub use pg::PgKv;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a key, optionally expiring after `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// List up to `limit` live keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;
}

/// Best-effort set-if-absent over a store with no compare-and-swap: read,
/// and only write when the key is missing. Two concurrent callers can both
/// observe absence, so callers must treat a successful claim as a
/// probability reducer and rely on their post-success dedupe stamps for
/// correctness.
pub async fn try_claim(kv: &dyn KvStore, key: &str, ttl: Duration) -> Result<bool> {
    if kv.get(key).await?.is_some() {
        return Ok(false);
    }
    kv.put(key, "1", Some(ttl)).await?;
    Ok(true)
}

// Arc blanket impl so tests can share the store for assertions.
#[async_trait]
impl<K: KvStore + ?Sized> KvStore for Arc<K> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        (**self).put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        (**self).list(prefix, limit).await
    }
}
