use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult};
use crate::idempotency::{
    IdempotencyRecord, IdempotencyStore, compute_request_hash, idempotency_lock_key,
};
use crate::message::MessageKind;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use switchyard_cache::DistributedLock;
use tokio::time::Instant;
use tracing::{debug, warn};

enum Claim {
    /// This dispatch holds the in-flight lock.
    Owned(HeldLock),
    /// Another dispatch finished first; its result is returned.
    Replayed(Value),
}

/// In-flight lock owned by one dispatch.
///
/// Released explicitly once the outcome is stored. If the dispatch is dropped
/// or panics first, the release is spawned from `drop` so retries of the same
/// key are not blocked until the lock expires.
struct HeldLock {
    lock: Arc<dyn DistributedLock>,
    lock_key: String,
    released: bool,
}

impl HeldLock {
    async fn release(mut self) {
        self.released = true;
        release_lock(&self.lock, &self.lock_key).await;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lock = Arc::clone(&self.lock);
        let lock_key = std::mem::take(&mut self.lock_key);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(lock_key = %lock_key, "Dispatch abandoned, releasing idempotency lock");
                runtime.spawn(async move { release_lock(&lock, &lock_key).await });
            }
            Err(_) => {
                warn!(lock_key = %lock_key, "No runtime to release abandoned idempotency lock");
            }
        }
    }
}

async fn release_lock(lock: &Arc<dyn DistributedLock>, lock_key: &str) {
    if let Err(e) = lock.release(lock_key).await {
        warn!(lock_key, error = %e, "Failed to release idempotency lock");
    }
}

/// Executes a command at most once per idempotency key.
///
/// A repeated key with the same request returns the stored result without
/// running the handler. A repeated key with a different request fails with
/// [`DispatchError::IdempotencyKeyConflict`]. Failed commands leave no record.
pub struct IdempotencyMiddleware {
    store: Arc<IdempotencyStore>,
}

impl IdempotencyMiddleware {
    pub fn new(store: Arc<IdempotencyStore>) -> Self {
        Self { store }
    }

    fn store_error(&self, error: impl std::fmt::Display) -> DispatchError {
        DispatchError::middleware(self.name(), error.to_string())
    }

    /// Stored result for `key`, if one exists for this request.
    async fn replay(&self, key: &str, request_hash: &str) -> Result<Option<Value>, DispatchError> {
        match self.store.get(key).await.map_err(|e| self.store_error(e))? {
            Some(record) if record.matches(request_hash) => {
                debug!(idempotency_key = key, "Replaying stored result");
                Ok(Some(record.stored_result))
            }
            Some(_) => {
                warn!(idempotency_key = key, "Idempotency key reused with a different request");
                Err(DispatchError::IdempotencyKeyConflict {
                    key: key.to_string(),
                })
            }
            None => Ok(None),
        }
    }

    /// Take the in-flight lock, or wait for the holder's record.
    async fn claim(
        &self,
        lock: &Arc<dyn DistributedLock>,
        key: &str,
        request_hash: &str,
    ) -> Result<Claim, DispatchError> {
        let config = self.store.config();
        let lock_key = idempotency_lock_key(key);
        let deadline = Instant::now() + config.in_flight_wait;

        loop {
            let acquired = lock
                .acquire(&lock_key, config.lock_ttl)
                .await
                .map_err(|e| self.store_error(e))?;

            if acquired {
                let held = HeldLock {
                    lock: Arc::clone(lock),
                    lock_key,
                    released: false,
                };
                // The previous holder may have stored its record just before releasing.
                return match self.replay(key, request_hash).await {
                    Ok(None) => Ok(Claim::Owned(held)),
                    Ok(Some(value)) => {
                        held.release().await;
                        Ok(Claim::Replayed(value))
                    }
                    Err(e) => {
                        held.release().await;
                        Err(e)
                    }
                };
            }

            if Instant::now() >= deadline {
                return Err(DispatchError::IdempotencyInProgress {
                    key: key.to_string(),
                });
            }

            tokio::time::sleep(config.poll_interval).await;

            if let Some(value) = self.replay(key, request_hash).await? {
                return Ok(Claim::Replayed(value));
            }
        }
    }
}

#[async_trait]
impl Middleware for IdempotencyMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        if envelope.kind() != MessageKind::Command {
            return next.run(envelope).await;
        }
        let Some(key) = envelope.idempotency_key().map(str::to_owned) else {
            return next.run(envelope).await;
        };
        let request_hash = compute_request_hash(envelope.message_type(), envelope.payload());

        if let Some(value) = self.replay(&key, &request_hash).await? {
            return Ok(value);
        }

        let held = match self.store.lock() {
            Some(lock) => match self.claim(lock, &key, &request_hash).await? {
                Claim::Owned(held) => Some(held),
                Claim::Replayed(value) => return Ok(value),
            },
            None => None,
        };

        let result = next.run(envelope).await;

        if let Ok(value) = &result {
            let record = IdempotencyRecord::new(key.as_str(), request_hash, value.clone());
            if let Err(e) = self.store.put(&record).await {
                warn!(idempotency_key = %key, error = %e, "Failed to store idempotency record");
            }
        }

        if let Some(held) = held {
            held.release().await;
        }

        result
    }

    fn name(&self) -> &'static str {
        "idempotency"
    }
}
