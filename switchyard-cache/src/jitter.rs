//! Query cache with TTL jitter, early recompute and stampede prevention.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_cache::{JitterConfig, JitteredCache};
//! use std::time::Duration;
//!
//! let cache = JitteredCache::in_memory(JitterConfig::default())?;
//!
//! let report: Report = cache
//!     .get_or_compute("report:daily", Duration::from_secs(300), &[], || async {
//!         build_report().await
//!     })
//!     .await?;
//! ```

use crate::error::{CacheError, CacheResult};
use crate::lock::{DistributedLock, InMemoryLock};
use crate::memory::InMemoryCache;
use crate::tags::TagIndex;
use crate::traits::CacheStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Jitter and stampede settings.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Lower bound of the TTL extension, as a fraction of the base TTL.
    pub min_jitter_percent: f64,
    /// Upper bound of the TTL extension, as a fraction of the base TTL.
    pub max_jitter_percent: f64,
    /// How long a recompute lock is held, and how long other callers wait on it.
    pub lock_timeout: Duration,
    /// How often waiting callers re-check the cache.
    pub lock_poll_interval: Duration,
    /// Remaining TTL below which a hit may trigger a background recompute.
    pub early_recompute_window: Duration,
    /// Chance that a hit inside the window triggers the recompute.
    pub early_recompute_probability: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            min_jitter_percent: 0.0,
            max_jitter_percent: 0.15,
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(25),
            early_recompute_window: Duration::from_secs(5),
            early_recompute_probability: 0.1,
        }
    }
}

impl JitterConfig {
    /// Set the jitter range.
    pub fn jitter_range(mut self, min_percent: f64, max_percent: f64) -> Self {
        self.min_jitter_percent = min_percent;
        self.max_jitter_percent = max_percent;
        self
    }

    /// Set the lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the poll interval for callers waiting on a lock holder.
    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Configure early recompute.
    pub fn early_recompute(mut self, window: Duration, probability: f64) -> Self {
        self.early_recompute_window = window;
        self.early_recompute_probability = probability;
        self
    }

    /// Disable early recompute.
    pub fn without_early_recompute(self) -> Self {
        self.early_recompute(Duration::ZERO, 0.0)
    }

    /// Check that the settings are consistent.
    pub fn validate(&self) -> CacheResult<()> {
        let (min, max) = (self.min_jitter_percent, self.max_jitter_percent);
        if !(min >= 0.0 && min <= max && max.is_finite()) {
            return Err(CacheError::Config(format!(
                "jitter range must satisfy 0 <= min <= max, got [{}, {}]",
                min, max
            )));
        }
        if !(0.0..=1.0).contains(&self.early_recompute_probability) {
            return Err(CacheError::Config(format!(
                "early_recompute_probability must be within [0, 1], got {}",
                self.early_recompute_probability
            )));
        }
        if self.lock_timeout.is_zero() {
            return Err(CacheError::Config("lock_timeout must be positive".into()));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(CacheError::Config(
                "lock_poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Value stored in the cache provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: DateTime<Utc>,
    /// TTL actually applied to the entry.
    pub ttl: Duration,
    /// Whether `ttl` differs from the requested base TTL.
    pub jittered: bool,
}

enum LockOutcome {
    Acquired,
    Held,
    Unavailable,
}

/// Removes a key from the in-flight refresh set when dropped.
struct RefreshSlot {
    refreshing: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

/// Tag index entries of expired keys are pruned on every this many writes.
const TAG_PRUNE_INTERVAL: u64 = 256;

/// Cache key of the recompute lock protecting `key`.
pub fn lock_key(key: &str) -> String {
    format!("lock:{}", key)
}

/// Cache whose entries expire at staggered times and are recomputed by one
/// caller at a time.
///
/// Read and write failures of the underlying provider are logged and treated
/// as misses, so a broken cache degrades to always computing.
#[derive(Clone)]
pub struct JitteredCache {
    store: Arc<dyn CacheStore>,
    lock: Arc<dyn DistributedLock>,
    config: Arc<JitterConfig>,
    tags: Arc<TagIndex>,
    refreshing: Arc<DashMap<String, ()>>,
    writes: Arc<AtomicU64>,
}

impl std::fmt::Debug for JitteredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitteredCache")
            .field("config", &self.config)
            .field("refreshing", &self.refreshing.len())
            .finish()
    }
}

impl JitteredCache {
    /// Create a cache over `store`, using `lock` for recompute coordination.
    pub fn new(
        store: Arc<dyn CacheStore>,
        lock: Arc<dyn DistributedLock>,
        config: JitterConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            lock,
            config: Arc::new(config),
            tags: Arc::new(TagIndex::default()),
            refreshing: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create a process-local cache.
    pub fn in_memory(config: JitterConfig) -> CacheResult<Self> {
        Self::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryLock::new()),
            config,
        )
    }

    /// Get the configuration.
    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// Get the underlying cache provider.
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// `base_ttl` extended by a uniform fraction in the configured range.
    pub fn jittered_ttl(&self, base_ttl: Duration) -> Duration {
        let (min, max) = (
            self.config.min_jitter_percent,
            self.config.max_jitter_percent,
        );
        let percent = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        let factor = (1.0 + percent).max(0.0);
        Duration::try_from_secs_f64(base_ttl.as_secs_f64() * factor).unwrap_or(base_ttl)
    }

    /// Read the stored entry for `key`.
    pub async fn entry<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<CacheEntry<T>>> {
        match self.store.get_json(key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Read the value stored for `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        Ok(self.entry(key).await?.map(|entry| entry.value))
    }

    /// Store `value` under a jittered TTL, returning the TTL applied.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        base_ttl: Duration,
        tags: &[String],
    ) -> CacheResult<Duration> {
        let ttl = self.jittered_ttl(base_ttl);
        let entry = CacheEntry {
            value,
            created_at: Utc::now(),
            ttl,
            jittered: ttl != base_ttl,
        };
        let json =
            serde_json::to_string(&entry).map_err(|e| CacheError::Serialization(e.to_string()))?;

        self.store.set_json(key, json, Some(ttl)).await?;
        self.tags.tag(key, tags).await;

        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % TAG_PRUNE_INTERVAL == 0 {
            self.prune_tags().await;
        }

        debug!(key, base_ttl = ?base_ttl, ttl = ?ttl, "Cached value");
        Ok(ttl)
    }

    /// Remove `key`.
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.store.delete(key).await?;
        self.tags.untag_key(key).await;
        Ok(())
    }

    /// Remove every key carrying `tag`, returning how many were removed.
    pub async fn invalidate_tag(&self, tag: &str) -> CacheResult<usize> {
        let keys = self.tags.keys_for(tag).await;
        for key in &keys {
            self.invalidate(key).await?;
        }
        debug!(tag, count = keys.len(), "Invalidated cache tag");
        Ok(keys.len())
    }

    /// Remove every key carrying any of `tags`.
    pub async fn invalidate_tags(&self, tags: &[String]) -> CacheResult<usize> {
        let mut removed = 0;
        for tag in tags {
            removed += self.invalidate_tag(tag).await?;
        }
        Ok(removed)
    }

    /// Live keys currently carrying `tag`. Expired keys found on the way are
    /// dropped from the index.
    pub async fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        let mut live = Vec::new();
        for key in self.tags.keys_for(tag).await {
            match self.store.exists(&key).await {
                Ok(false) => self.tags.untag_key(&key).await,
                _ => live.push(key),
            }
        }
        live
    }

    /// Drop tag index entries whose keys have expired, returning how many
    /// were removed.
    pub async fn prune_tags(&self) -> usize {
        let mut pruned = 0;
        for key in self.tags.keys().await {
            match self.store.exists(&key).await {
                Ok(true) => {}
                Ok(false) => {
                    self.tags.untag_key(&key).await;
                    pruned += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Tag pruning stopped, cache provider unavailable");
                    break;
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "Pruned expired keys from tag index");
        }
        pruned
    }

    /// Remove everything.
    pub async fn clear(&self) -> CacheResult<()> {
        self.store.clear().await?;
        self.tags.clear().await;
        Ok(())
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    ///
    /// On a miss one caller takes the recompute lock and computes; the others
    /// poll the cache until the holder stores the value. A caller that sees
    /// nothing within `lock_timeout` computes the value itself. If the holder
    /// fails, the next waiter to find the lock free takes over.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        base_ttl: Duration,
        tags: &[String],
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(value) = self.lookup::<T>(key).await {
            self.maybe_refresh_early(key, base_ttl, tags, &compute).await;
            return Ok(value);
        }

        let lock_key = lock_key(key);
        let deadline = Instant::now() + self.config.lock_timeout;

        loop {
            match self.try_lock(&lock_key).await {
                LockOutcome::Acquired => {
                    let result = self.compute_under_lock(key, base_ttl, tags, &compute).await;
                    self.unlock(&lock_key).await;
                    return result;
                }
                LockOutcome::Unavailable => break,
                LockOutcome::Held => {}
            }

            if Instant::now() >= deadline {
                warn!(
                    key,
                    lock_timeout = ?self.config.lock_timeout,
                    "Gave up waiting for recompute lock, computing independently"
                );
                break;
            }

            tokio::time::sleep(self.config.lock_poll_interval).await;

            if let Some(value) = self.lookup::<T>(key).await {
                debug!(key, "Served value computed by lock holder");
                return Ok(value);
            }
        }

        let value = compute().await?;
        self.store_quietly(key, &value, base_ttl, tags).await;
        Ok(value)
    }

    async fn compute_under_lock<T, E, F, Fut>(
        &self,
        key: &str,
        base_ttl: Duration,
        tags: &[String],
        compute: &F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // Another holder may have stored the value between our miss and the lock.
        if let Some(value) = self.lookup::<T>(key).await {
            return Ok(value);
        }

        let value = compute().await?;
        self.store_quietly(key, &value, base_ttl, tags).await;
        Ok(value)
    }

    async fn maybe_refresh_early<T, E, F, Fut>(
        &self,
        key: &str,
        base_ttl: Duration,
        tags: &[String],
        compute: &F,
    ) where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let window = self.config.early_recompute_window;
        let probability = self.config.early_recompute_probability;
        if window.is_zero() || probability <= 0.0 {
            return;
        }

        let remaining = match self.store.ttl(key).await {
            Ok(Some(remaining)) => remaining,
            _ => return,
        };
        if remaining > window {
            return;
        }

        let roll = rand::rng().random_bool(probability.min(1.0));
        if !roll || self.refreshing.insert(key.to_string(), ()).is_some() {
            return;
        }

        debug!(key, remaining = ?remaining, "Scheduling early recompute");

        let slot = RefreshSlot {
            refreshing: Arc::clone(&self.refreshing),
            key: key.to_string(),
        };
        let this = self.clone();
        let tags = tags.to_vec();
        let compute = compute.clone();

        tokio::spawn(async move {
            let key = slot.key.clone();
            let lock_key = lock_key(&key);
            if let LockOutcome::Acquired = this.try_lock(&lock_key).await {
                match compute().await {
                    Ok(value) => this.store_quietly(&key, &value, base_ttl, &tags).await,
                    Err(e) => warn!(key = %key, error = %e, "Early recompute failed"),
                }
                this.unlock(&lock_key).await;
            }
            drop(slot);
        });
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    async fn store_quietly<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        base_ttl: Duration,
        tags: &[String],
    ) {
        if let Err(e) = self.set(key, value, base_ttl, tags).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    async fn try_lock(&self, lock_key: &str) -> LockOutcome {
        match self.lock.acquire(lock_key, self.config.lock_timeout).await {
            Ok(true) => LockOutcome::Acquired,
            Ok(false) => LockOutcome::Held,
            Err(e) => {
                warn!(lock_key, error = %e, "Recompute lock unavailable");
                LockOutcome::Unavailable
            }
        }
    }

    async fn unlock(&self, lock_key: &str) {
        if let Err(e) = self.lock.release(lock_key).await {
            warn!(lock_key, error = %e, "Failed to release recompute lock");
        }
    }
}
