//! Cache provider abstraction and stampede-resistant query cache.
//!
//! [`CacheStore`] is the narrow provider interface the dispatch pipeline
//! consumes; [`InMemoryCache`] implements it in-process. [`JitteredCache`]
//! layers TTL jitter, probabilistic early recompute, lock-based stampede
//! prevention and tag invalidation on top of any provider.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchyard_cache::*;
//! use std::time::Duration;
//!
//! let cache = JitteredCache::in_memory(JitterConfig::default().jitter_range(0.0, 0.15))?;
//!
//! let ttl = cache.set("user:42", &user, Duration::from_secs(100), &["users".into()]).await?;
//! assert!(ttl <= Duration::from_secs(115));
//!
//! cache.invalidate_tag("users").await?;
//! ```

pub mod error;
pub mod jitter;
pub mod lock;
pub mod memory;
mod tags;
pub mod traits;

pub use error::*;
pub use jitter::*;
pub use lock::*;
pub use memory::*;
pub use traits::*;
