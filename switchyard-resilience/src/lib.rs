//! # Resilience Patterns
//!
//! Fault-tolerance primitives used by the Switchyard dispatch pipeline. Each
//! primitive wraps an arbitrary future and reports failures as a typed error,
//! so they compose with each other and with the bus middlewares.
//!
//! ## Patterns Included
//!
//! - **Circuit Breaker**: Stop calling a failing dependency for a cooldown period
//! - **Retry**: Re-run transient failures with configurable backoff
//! - **Bulkhead**: Bound concurrent executions of a named resource
//! - **Timeout**: Race an operation against a deadline with cooperative cancellation
//! - **Fallback**: Substitute a value when the primary operation fails
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchyard_resilience::{CircuitBreaker, CircuitBreakerConfig, Retry, RetryConfig};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("inventory")
//!         .failure_threshold(5)
//!         .timeout(Duration::from_secs(30)),
//! );
//! let retry = Retry::new(RetryConfig::new(3));
//!
//! let result = circuit
//!     .call(|| async { retry.call(|| fetch_inventory()).await })
//!     .await;
//! ```

mod bulkhead;
mod circuit_breaker;
mod clock;
mod fallback;
mod registry;
mod retry;
mod timeout;

pub use bulkhead::*;
pub use circuit_breaker::*;
pub use clock::*;
pub use fallback::*;
pub use registry::*;
pub use retry::*;
pub use timeout::*;

pub use tokio_util::sync::CancellationToken;
