//! Retry pattern with configurable backoff strategies.
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_resilience::{Retry, RetryConfig};
//! use std::time::Duration;
//!
//! let retry = Retry::new(
//!     RetryConfig::new(4)
//!         .base_delay(Duration::from_millis(50))
//!         .max_delay(Duration::from_secs(2)),
//! );
//!
//! let result = retry
//!     .call_if(|| client.fetch(), |e| e.is_transient())
//!     .await;
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Constant delay between retries.
    Constant(Duration),
    /// Linear backoff: delay increases by a fixed amount.
    Linear {
        /// Initial delay.
        initial: Duration,
        /// Increment per retry.
        increment: Duration,
        /// Maximum delay.
        max: Duration,
    },
    /// Exponential backoff: `min(base * multiplier^(attempt - 1), max)`.
    Exponential {
        /// Delay after the first failure.
        base: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
        /// Maximum delay before jitter.
        max: Duration,
        /// Scale each delay by a uniform factor in `[0.5, 1.5]`.
        jitter: bool,
    },
}

impl BackoffStrategy {
    /// Create constant backoff.
    pub fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    /// Create linear backoff.
    pub fn linear(initial: Duration, increment: Duration) -> Self {
        Self::Linear {
            initial,
            increment,
            max: Duration::from_secs(60),
        }
    }

    /// Create exponential backoff doubling from `base`.
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        }
    }

    /// Set maximum delay.
    pub fn with_max(self, max: Duration) -> Self {
        match self {
            Self::Linear {
                initial, increment, ..
            } => Self::Linear {
                initial,
                increment,
                max,
            },
            Self::Exponential {
                base,
                multiplier,
                jitter,
                ..
            } => Self::Exponential {
                base,
                multiplier,
                max,
                jitter,
            },
            other => other,
        }
    }

    /// Enable or disable jitter on exponential backoff.
    pub fn with_jitter(self, enabled: bool) -> Self {
        match self {
            Self::Exponential {
                base,
                multiplier,
                max,
                ..
            } => Self::Exponential {
                base,
                multiplier,
                max,
                jitter: enabled,
            },
            other => other,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let retries_so_far = attempt.saturating_sub(1);
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear {
                initial,
                increment,
                max,
            } => (*initial + increment.saturating_mul(retries_so_far)).min(*max),
            Self::Exponential {
                base,
                multiplier,
                max,
                jitter,
            } => {
                let exponent = retries_so_far.min(i32::MAX as u32) as i32;
                let raw = base.as_secs_f64() * multiplier.powi(exponent);
                let capped = raw.min(max.as_secs_f64());
                let secs = if *jitter {
                    capped * rand::rng().random_range(0.5..=1.5)
                } else {
                    capped
                };
                Duration::try_from_secs_f64(secs).unwrap_or(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        RetryConfig::default().backoff()
    }
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Randomize delays to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Exponential backoff described by this configuration.
    pub fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::Exponential {
            base: self.base_delay,
            multiplier: self.multiplier,
            max: self.max_delay,
            jitter: self.jitter,
        }
    }
}

/// Retry error.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: E,
    },
    /// An attempt failed with an error the predicate refused to retry.
    Aborted {
        /// Attempt number that failed.
        attempt: u32,
        /// The non-retryable error.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Aborted { attempt, .. } => *attempt,
        }
    }

    /// Whether the attempt budget ran out.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The last underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::Aborted { error, .. } => error,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted {
                attempts,
                last_error,
            } => write!(f, "Failed after {} attempts: {}", attempts, last_error),
            Self::Aborted { attempt, error } => {
                write!(f, "Non-retryable failure on attempt {}: {}", attempt, error)
            }
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Retry executor.
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
    backoff: BackoffStrategy,
}

impl Retry {
    /// Create a new retry executor using the configuration's exponential backoff.
    pub fn new(config: RetryConfig) -> Self {
        let backoff = config.backoff();
        Self { config, backoff }
    }

    /// Replace the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute with retry logic, retrying every error.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.call_if(f, |_| true).await
    }

    /// Execute with retry logic, retrying only errors accepted by `should_retry`.
    pub async fn call_if<F, Fut, T, E, P>(
        &self,
        mut f: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(attempt, error = %e, "Error is not retryable");
                        return Err(RetryError::Aborted { attempt, error: e });
                    }

                    if attempt >= max_attempts {
                        warn!(
                            attempt,
                            max_attempts,
                            error = %e,
                            "Final retry attempt failed"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }

                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Retry attempt failed, waiting before retry"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
