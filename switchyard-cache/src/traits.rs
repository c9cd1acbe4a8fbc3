//! Cache provider trait.

use crate::error::CacheResult;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::time::Duration;

/// Cache provider consumed by the idempotency store and the query cache.
///
/// Values are opaque JSON strings. Implementations must honour `ttl` on
/// `set_json`: an entry is never returned after its time-to-live elapses.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a JSON value from the cache.
    ///
    /// Returns `Ok(None)` if the key is missing or expired.
    async fn get_json(&self, key: &str) -> CacheResult<Option<String>>;

    /// Set a JSON value in the cache, optionally expiring after `ttl`.
    async fn set_json(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a key from the cache.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Check if a key exists in the cache.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Clear all keys from the cache.
    async fn clear(&self) -> CacheResult<()>;

    /// Remaining time-to-live of a key.
    ///
    /// Returns `Ok(None)` if the key has no expiration or doesn't exist.
    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>>;

    /// Set or update the expiration time for a key.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    /// Get multiple keys concurrently, in input order.
    async fn get_many(&self, keys: &[&str]) -> CacheResult<Vec<Option<String>>> {
        let futures = keys.iter().map(|key| self.get_json(key));
        try_join_all(futures).await
    }

    /// Delete multiple keys concurrently.
    async fn delete_many(&self, keys: &[&str]) -> CacheResult<()> {
        let futures = keys.iter().map(|key| self.delete(key));
        try_join_all(futures).await?;
        Ok(())
    }
}
