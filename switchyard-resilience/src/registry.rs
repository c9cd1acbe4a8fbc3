//! Named resource registries.
//!
//! Every caller protecting the same resource name shares one breaker or
//! bulkhead, so failures and concurrency are counted per resource rather than
//! per call site.

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::clock::{Clock, SystemClock};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Circuit breakers keyed by resource name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty registry whose breakers read `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
        }
    }

    /// Return the breaker for `name`, creating it from `template` on first use.
    ///
    /// The template's own name is replaced by `name`. An existing breaker keeps
    /// the configuration it was created with.
    pub fn get_or_create(&self, name: &str, template: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(name, "Registering circuit breaker");
            let mut config = template.clone();
            config.name = name.to_string();
            CircuitBreaker::with_clock(config, Arc::clone(&self.clock))
        });
        Arc::clone(entry.value())
    }

    /// Look up an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Remove a breaker. Callers holding it keep their handle.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Statistics for every registered breaker.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.iter().map(|b| b.value().stats()).collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bulkheads keyed by resource name.
#[derive(Debug, Default)]
pub struct BulkheadRegistry {
    bulkheads: DashMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bulkhead for `name`, creating it from `template` on first use.
    pub fn get_or_create(&self, name: &str, template: &BulkheadConfig) -> Arc<Bulkhead> {
        if let Some(existing) = self.bulkheads.get(name) {
            return Arc::clone(existing.value());
        }

        let entry = self.bulkheads.entry(name.to_string()).or_insert_with(|| {
            let mut config = template.clone();
            config.name = name.to_string();
            Bulkhead::new(config)
        });
        Arc::clone(entry.value())
    }

    /// Look up an existing bulkhead.
    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Number of registered bulkheads.
    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }

    /// Statistics for every registered bulkhead.
    pub fn stats(&self) -> Vec<BulkheadStats> {
        self.bulkheads.iter().map(|b| b.value().stats()).collect()
    }
}
