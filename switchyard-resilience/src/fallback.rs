//! Fallback pattern for graceful degradation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_resilience::Fallback;
//!
//! let fallback = Fallback::compute(|err: FetchError| async move {
//!     tracing::debug!(%err, "serving stale prices");
//!     Ok(PriceList::stale())
//! });
//!
//! let prices = fallback.call(|| pricing.fetch()).await;
//! ```

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Type alias for an async fallback computation receiving the primary error.
pub type FallbackFn<T, E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

enum Strategy<T, E> {
    Value(T),
    Compute(FallbackFn<T, E>),
}

impl<T: Clone, E> Clone for Strategy<T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(v) => Self::Value(v.clone()),
            Self::Compute(f) => Self::Compute(Arc::clone(f)),
        }
    }
}

/// Fallback handler that provides alternative behavior.
pub struct Fallback<T, E> {
    strategy: Option<Strategy<T, E>>,
    name: String,
}

impl<T, E> Fallback<T, E>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Fall back to a precomputed value.
    pub fn value(value: T) -> Self {
        Self {
            strategy: Some(Strategy::Value(value)),
            name: "default".to_string(),
        }
    }

    /// Fall back to a computation receiving the primary error.
    pub fn compute<F, Fut>(fallback: F) -> Self
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            strategy: Some(Strategy::Compute(Arc::new(move |e| Box::pin(fallback(e))))),
            name: "default".to_string(),
        }
    }

    /// No fallback: the primary error propagates.
    pub fn none() -> Self {
        Self {
            strategy: None,
            name: "default".to_string(),
        }
    }

    /// Set the fallback name for logging.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether a fallback is configured.
    pub fn is_configured(&self) -> bool {
        self.strategy.is_some()
    }

    /// Execute the primary operation, falling back on failure.
    pub async fn call<F, Fut>(&self, primary: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_if(primary, |_| true).await
    }

    /// Execute with fallback only for errors accepted by `should_fallback`.
    pub async fn call_if<F, Fut, P>(&self, primary: F, should_fallback: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        match primary().await {
            Ok(result) => Ok(result),
            Err(e) if should_fallback(&e) => self.recover(e).await,
            Err(e) => Err(e),
        }
    }

    /// Apply the fallback to an error already produced.
    pub async fn recover(&self, error: E) -> Result<T, E> {
        match &self.strategy {
            Some(Strategy::Value(v)) => {
                debug!(name = %self.name, "Primary operation failed, using fallback value");
                Ok(v.clone())
            }
            Some(Strategy::Compute(f)) => {
                debug!(name = %self.name, "Primary operation failed, computing fallback");
                f(error).await
            }
            None => Err(error),
        }
    }
}

impl<T: Clone, E> Clone for Fallback<T, E> {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy.clone(),
            name: self.name.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Fallback<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let strategy = match self.strategy {
            Some(Strategy::Value(_)) => "value",
            Some(Strategy::Compute(_)) => "compute",
            None => "none",
        };
        f.debug_struct("Fallback")
            .field("name", &self.name)
            .field("strategy", &strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_fallback_on_failure() {
        let fallback: Fallback<i32, &str> = Fallback::value(0);

        let result = fallback.call(|| async { Err("failed") }).await;

        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_fallback_on_success() {
        let fallback: Fallback<i32, &str> = Fallback::value(0);

        let result = fallback.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_compute_receives_error() {
        let fallback: Fallback<String, String> =
            Fallback::compute(|e: String| async move { Ok(format!("recovered from {}", e)) });

        let result = fallback.call(|| async { Err("outage".to_string()) }).await;

        assert_eq!(result.unwrap(), "recovered from outage");
    }

    #[tokio::test]
    async fn test_none_propagates_original_error() {
        let fallback: Fallback<i32, &str> = Fallback::none();

        let result = fallback.call(|| async { Err("original") }).await;

        assert_eq!(result.unwrap_err(), "original");
    }

    #[tokio::test]
    async fn test_call_if_skips_excluded_errors() {
        let computed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&computed);
        let fallback: Fallback<i32, &str> = Fallback::compute(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(1) }
        });

        let result = fallback
            .call_if(|| async { Err("not found") }, |e| *e != "not found")
            .await;

        assert_eq!(result.unwrap_err(), "not found");
        assert_eq!(computed.load(Ordering::SeqCst), 0);
    }
}
