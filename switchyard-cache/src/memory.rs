//! Process-local cache provider.

use crate::error::CacheResult;
use crate::traits::CacheStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Expired entries are swept on every this many writes.
const SWEEP_INTERVAL: u64 = 128;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }
}

/// In-memory cache backed by a `HashMap`.
///
/// Expiry uses the tokio clock, so paused test time controls it. Expired
/// entries are dropped when read and swept periodically on writes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    data: Arc<RwLock<HashMap<String, StoredValue>>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryCache {
    /// Create new in-memory cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut data = self.data.write().await;
        let before = data.len();
        let now = Instant::now();
        data.retain(|_, entry| entry.is_live(now));
        before - data.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get_json(&self, key: &str) -> CacheResult<Option<String>> {
        {
            let data = self.data.read().await;
            match data.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(Instant::now()) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|entry| !entry.is_live(Instant::now())) {
            data.remove(key);
        }
        Ok(None)
    }

    async fn set_json(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let now = Instant::now();
        let expires_at = ttl.map(|d| now + d);
        let mut data = self.data.write().await;
        data.insert(key.to_string(), StoredValue { value, expires_at });

        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            data.retain(|_, entry| entry.is_live(now));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.get_json(key).await.map(|v| v.is_some())
    }

    async fn clear(&self) -> CacheResult<()> {
        self.data.write().await.clear();
        Ok(())
    }

    async fn ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data
            .get(key)
            .and_then(|entry| entry.expires_at)
            .filter(|exp| *exp > now)
            .map(|exp| exp - now))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut data = self.data.write().await;
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set_json("k", "\"v\"".to_string(), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get_json("k").await.unwrap().as_deref(), Some("\"v\""));
        assert_eq!(cache.ttl("k").await.unwrap(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get_json("k").await.unwrap().is_none());
        assert!(!cache.exists("k").await.unwrap());
        assert_eq!(cache.purge_expired().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_dropped_on_read() {
        let cache = InMemoryCache::new();
        cache
            .set_json("k", "1".to_string(), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(cache.get_json("k").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_entries() {
        let cache = InMemoryCache::new();
        for i in 0..1_000 {
            cache
                .set_json(&format!("old-{}", i), "1".to_string(), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        for i in 0..SWEEP_INTERVAL {
            cache
                .set_json(&format!("new-{}", i), "2".to_string(), None)
                .await
                .unwrap();
        }

        assert_eq!(cache.len().await, SWEEP_INTERVAL as usize);
    }

    #[tokio::test]
    async fn test_entry_without_ttl_persists() {
        let cache = InMemoryCache::new();
        cache.set_json("k", "1".to_string(), None).await.unwrap();

        assert!(cache.exists("k").await.unwrap());
        assert!(cache.ttl("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_operations() {
        let cache = InMemoryCache::new();
        cache.set_json("a", "1".to_string(), None).await.unwrap();
        cache.set_json("b", "2".to_string(), None).await.unwrap();

        let values = cache.get_many(&["a", "missing", "b"]).await.unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("2".to_string())]
        );

        cache.delete_many(&["a", "b"]).await.unwrap();
        assert!(cache.is_empty().await);
    }
}
