//! Timeout pattern with cooperative cancellation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_resilience::{CancellationToken, Timeout};
//! use std::time::Duration;
//!
//! let timeout = Timeout::with_duration(Duration::from_secs(5));
//!
//! let result = timeout
//!     .spawn_cancellable(CancellationToken::new(), |token| async move {
//!         tokio::select! {
//!             _ = token.cancelled() => Err("cancelled"),
//!             rows = load_rows() => Ok(rows),
//!         }
//!     })
//!     .await;
//! ```

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Timeout configuration.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Name for logging/metrics.
    pub name: String,
    /// Timeout duration.
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            duration: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    /// Set the name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Timeout error.
#[derive(Debug)]
pub enum TimeoutError<E> {
    /// The deadline passed before the operation finished.
    Elapsed(Duration),
    /// Operation failed.
    Execution(E),
    /// The spawned operation panicked.
    Panicked(String),
}

impl<E> TimeoutError<E> {
    /// Whether the deadline was exceeded.
    pub fn is_elapsed(&self) -> bool {
        matches!(self, Self::Elapsed(_))
    }
}

impl<E: std::fmt::Display> std::fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Elapsed(d) => write!(f, "Operation timed out after {:?}", d),
            Self::Execution(e) => write!(f, "Operation failed: {}", e),
            Self::Panicked(msg) => write!(f, "Operation panicked: {}", msg),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for TimeoutError<E> {}

/// Timeout executor.
#[derive(Debug, Clone)]
pub struct Timeout {
    config: TimeoutConfig,
}

impl Timeout {
    /// Create a new timeout executor.
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    /// Create with a duration.
    pub fn with_duration(duration: Duration) -> Self {
        Self::new(TimeoutConfig::new(duration))
    }

    /// Get the timeout duration.
    pub fn duration(&self) -> Duration {
        self.config.duration
    }

    /// Execute with timeout. On expiry the operation future is dropped.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, TimeoutError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.config.duration, f()).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(TimeoutError::Execution(e)),
            Err(_) => {
                self.log_elapsed();
                Err(TimeoutError::Elapsed(self.config.duration))
            }
        }
    }

    /// Execute on a separate task and signal `token` on expiry.
    ///
    /// The operation is never aborted. After the deadline it keeps running
    /// until it observes the token or completes, and its result is discarded.
    pub async fn spawn_cancellable<F, Fut, T, E>(
        &self,
        token: CancellationToken,
        f: F,
    ) -> Result<T, TimeoutError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut handle = tokio::spawn(f(token.clone()));

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(TimeoutError::Execution(e)),
                Err(join_error) => Err(TimeoutError::Panicked(join_error.to_string())),
            },
            _ = tokio::time::sleep(self.config.duration) => {
                token.cancel();
                self.log_elapsed();
                Err(TimeoutError::Elapsed(self.config.duration))
            }
        }
    }

    fn log_elapsed(&self) {
        warn!(
            name = %self.config.name,
            duration = ?self.config.duration,
            "Operation timed out"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_timeout_completes() {
        let timeout = Timeout::with_duration(Duration::from_secs(1));

        let result: Result<i32, TimeoutError<&str>> = timeout.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires() {
        let timeout = Timeout::with_duration(Duration::from_millis(10));

        let result: Result<i32, TimeoutError<&str>> = timeout
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(42)
            })
            .await;

        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_cancels_token_and_operation_observes_it() {
        let timeout = Timeout::with_duration(Duration::from_millis(50));
        let token = CancellationToken::new();
        let (observed_tx, observed_rx) = oneshot::channel();

        let result: Result<(), TimeoutError<&str>> = timeout
            .spawn_cancellable(token.clone(), |token| async move {
                token.cancelled().await;
                let _ = observed_tx.send(());
                Err("cancelled")
            })
            .await;

        assert!(result.unwrap_err().is_elapsed());
        assert!(token.is_cancelled());
        observed_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_operation_result_is_returned() {
        let timeout = Timeout::with_duration(Duration::from_secs(1));
        let token = CancellationToken::new();

        let result: Result<u8, TimeoutError<&str>> = timeout
            .spawn_cancellable(token.clone(), |_| async { Ok(9) })
            .await;

        assert_eq!(result.unwrap(), 9);
        assert!(!token.is_cancelled());
    }

    async fn explode() -> Result<(), &'static str> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn test_spawned_panic_is_reported() {
        let timeout = Timeout::with_duration(Duration::from_secs(1));

        let result: Result<(), TimeoutError<&str>> = timeout
            .spawn_cancellable(CancellationToken::new(), |_| explode())
            .await;

        assert!(matches!(result, Err(TimeoutError::Panicked(_))));
    }
}
