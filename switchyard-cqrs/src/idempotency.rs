//! Idempotency records and the store that keeps them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use switchyard_cache::{CacheResult, CacheStore, DistributedLock, InMemoryCache, InMemoryLock};

/// Stored outcome of a completed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Fingerprint of the request that produced the result.
    pub request_hash: String,
    pub stored_result: Value,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key: impl Into<String>, request_hash: impl Into<String>, stored_result: Value) -> Self {
        Self {
            key: key.into(),
            request_hash: request_hash.into(),
            stored_result,
            created_at: Utc::now(),
        }
    }

    /// Whether `request_hash` describes the same request.
    pub fn matches(&self, request_hash: &str) -> bool {
        self.request_hash == request_hash
    }
}

/// Idempotency configuration
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long records are kept
    pub ttl: Duration,
    /// Prefix for record keys
    pub key_prefix: String,
    /// Upper bound on how long one execution holds the in-flight lock
    pub lock_ttl: Duration,
    /// How long a concurrent duplicate waits for the first request to finish
    pub in_flight_wait: Duration,
    /// Poll interval while waiting
    pub poll_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            key_prefix: "idempotency:".to_string(),
            lock_ttl: Duration::from_secs(5 * 60),
            in_flight_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn in_flight_wait(mut self, wait: Duration) -> Self {
        self.in_flight_wait = wait;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Idempotency records kept in a cache provider.
///
/// With a lock configured, concurrent requests sharing a key are serialized:
/// only the lock holder runs the command, the others wait for its record.
#[derive(Clone)]
pub struct IdempotencyStore {
    cache: Arc<dyn CacheStore>,
    lock: Option<Arc<dyn DistributedLock>>,
    config: IdempotencyConfig,
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn CacheStore>, config: IdempotencyConfig) -> Self {
        Self {
            cache,
            lock: None,
            config,
        }
    }

    /// Process-local store with in-flight locking.
    pub fn in_memory(config: IdempotencyConfig) -> Self {
        Self::new(Arc::new(InMemoryCache::new()), config).with_lock(Arc::new(InMemoryLock::new()))
    }

    /// Serialize concurrent requests for the same key through `lock`.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> Option<&Arc<dyn DistributedLock>> {
        self.lock.as_ref()
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Load the record for `key`.
    pub async fn get(&self, key: &str) -> CacheResult<Option<IdempotencyRecord>> {
        match self.cache.get_json(&self.record_key(key)).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| switchyard_cache::CacheError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Store a record for its configured TTL.
    pub async fn put(&self, record: &IdempotencyRecord) -> CacheResult<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| switchyard_cache::CacheError::Serialization(e.to_string()))?;
        self.cache
            .set_json(&self.record_key(&record.key), json, Some(self.config.ttl))
            .await
    }

    /// Forget the record for `key`.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        self.cache.delete(&self.record_key(key)).await
    }
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("config", &self.config)
            .field("locking", &self.lock.is_some())
            .finish()
    }
}

/// Lock key guarding in-flight execution for an idempotency key.
pub fn idempotency_lock_key(key: &str) -> String {
    format!("idempotency-lock:{}", key)
}

/// Fingerprint of a message: SHA-256 over its type and canonical JSON.
///
/// Object keys are sorted at every depth, so field order never changes the
/// hash.
pub fn compute_request_hash(message_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize `value` with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
