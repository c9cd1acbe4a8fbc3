//! Short-lived named locks.

use crate::error::CacheResult;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Lock shared by every process that reads the same cache provider.
///
/// A lock expires on its own after its TTL, so a holder that dies never blocks
/// others for longer than that.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take `key` for `ttl`. Returns `false` if someone else holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Release `key`.
    async fn release(&self, key: &str) -> CacheResult<()>;
}

/// Process-local lock table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLock {
    locks: Arc<DashMap<String, Instant>>,
}

impl InMemoryLock {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let now = Instant::now();
        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    false
                } else {
                    held.insert(now + ttl);
                    true
                }
            }
            Entry::Vacant(free) => {
                free.insert(now + ttl);
                true
            }
        };

        if acquired {
            debug!(key, ttl = ?ttl, "Acquired lock");
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> CacheResult<()> {
        self.locks.remove(key);
        debug!(key, "Released lock");
        Ok(())
    }
}
