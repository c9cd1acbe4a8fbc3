//! Bulkhead pattern for resource isolation.
//!
//! A bulkhead caps the number of concurrent executions against a named
//! resource. Callers beyond `max_concurrent` wait in a bounded queue; once the
//! queue holds `max_queue` callers, further callers are rejected immediately.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_resilience::{Bulkhead, BulkheadConfig};
//!
//! let bulkhead = Bulkhead::new(BulkheadConfig::new("reports", 4).max_queue(16));
//!
//! let result = bulkhead.call(|| async {
//!     render_report().await
//! }).await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Bulkhead configuration.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Name of the bulkhead (for logging/metrics).
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrent: u32,
    /// Maximum callers waiting for a permit.
    pub max_queue: u32,
    /// Maximum time a queued caller waits for a permit. `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 10,
            max_queue: 10,
            max_wait: None,
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration.
    pub fn new(name: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            ..Default::default()
        }
    }

    /// Set the queue bound.
    pub fn max_queue(mut self, size: u32) -> Self {
        self.max_queue = size;
        self
    }

    /// Set the maximum wait time for queued callers.
    pub fn max_wait(mut self, duration: Duration) -> Self {
        self.max_wait = Some(duration);
        self
    }
}

/// Bulkhead error.
#[derive(Debug)]
pub enum BulkheadError<E> {
    /// Every permit is taken and the queue is full.
    Rejected,
    /// Timed out waiting in the queue.
    Timeout,
    /// Execution failed.
    Execution(E),
}

impl<E> BulkheadError<E> {
    /// Returns the execution error, if any.
    pub fn into_execution(self) -> Option<E> {
        match self {
            Self::Execution(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for BulkheadError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "Bulkhead is at capacity"),
            Self::Timeout => write!(f, "Timed out waiting for bulkhead permit"),
            Self::Execution(e) => write!(f, "Execution failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BulkheadError<E> {}

/// Decrements a gauge when dropped.
struct GaugeGuard<'a>(&'a AtomicU32);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicU32) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bulkhead for limiting concurrent access.
#[derive(Debug)]
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Semaphore,
    active_count: AtomicU32,
    queued_count: AtomicU32,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
    total_timeouts: AtomicU64,
}

impl Bulkhead {
    /// Create a new bulkhead.
    pub fn new(config: BulkheadConfig) -> Arc<Self> {
        tracing::info!(
            name = %config.name,
            max_concurrent = config.max_concurrent,
            max_queue = config.max_queue,
            "Bulkhead initialized"
        );

        Arc::new(Self {
            semaphore: Semaphore::new(config.max_concurrent as usize),
            config,
            active_count: AtomicU32::new(0),
            queued_count: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
        })
    }

    /// Get the bulkhead name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get current number of active executions.
    pub fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Get current number of queued callers.
    pub fn queued_count(&self) -> u32 {
        self.queued_count.load(Ordering::SeqCst)
    }

    /// Get available permits.
    pub fn available_permits(&self) -> u32 {
        self.semaphore.available_permits() as u32
    }

    /// Check if a call would start immediately.
    pub fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Execute with bulkhead protection.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => self.wait_for_permit().await?,
        };

        let _active = GaugeGuard::enter(&self.active_count);
        let result = f().await;
        drop(permit);

        result.map_err(BulkheadError::Execution)
    }

    async fn wait_for_permit<E>(&self) -> Result<SemaphorePermit<'_>, BulkheadError<E>> {
        let max_queue = self.config.max_queue;
        let reserved = self
            .queued_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < max_queue).then_some(queued + 1)
            });

        if reserved.is_err() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(name = %self.config.name, max_queue, "Bulkhead queue full, rejecting request");
            return Err(BulkheadError::Rejected);
        }

        // Reserved by the update above; the guard only releases it.
        let _queued = GaugeGuard(&self.queued_count);

        let acquired = match self.config.max_wait {
            Some(max_wait) => {
                match tokio::time::timeout(max_wait, self.semaphore.acquire()).await {
                    Ok(acquired) => acquired,
                    Err(_) => {
                        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            name = %self.config.name,
                            max_wait = ?max_wait,
                            "Bulkhead timeout waiting for permit"
                        );
                        return Err(BulkheadError::Timeout);
                    }
                }
            }
            None => self.semaphore.acquire().await,
        };

        acquired.map_err(|_| {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            BulkheadError::Rejected
        })
    }

    /// Get statistics.
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.config.name.clone(),
            max_concurrent: self.config.max_concurrent,
            max_queue: self.config.max_queue,
            active_count: self.active_count(),
            queued_count: self.queued_count(),
            available_permits: self.available_permits(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Bulkhead statistics.
#[derive(Debug, Clone)]
pub struct BulkheadStats {
    pub name: String,
    pub max_concurrent: u32,
    pub max_queue: u32,
    pub active_count: u32,
    pub queued_count: u32,
    pub available_permits: u32,
    pub total_calls: u64,
    pub total_rejections: u64,
    pub total_timeouts: u64,
}

impl BulkheadStats {
    /// Share of permits currently in use.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            0.0
        } else {
            self.active_count as f64 / self.max_concurrent as f64
        }
    }

    /// Share of calls rejected outright.
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_rejections as f64 / self.total_calls as f64
        }
    }
}
