//! Circuit Breaker pattern implementation.
//!
//! The circuit breaker counts failures of a protected resource and "opens" to
//! reject calls once a threshold is reached, giving the resource time to
//! recover before a single trial call tests it again.
//!
//! ## States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Circuit is tripped, calls are rejected immediately
//! - **Half-Open**: One trial call decides between Closed and Open
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("payments")
//!         .failure_threshold(5)
//!         .timeout(Duration::from_secs(30)),
//! );
//!
//! match circuit.call(|| async { gateway.charge(order).await }).await {
//!     Ok(receipt) => Ok(receipt),
//!     Err(CircuitBreakerError::Open) => Err(PaymentError::Unavailable),
//!     Err(CircuitBreakerError::Execution(e)) => Err(e.into()),
//! }
//! ```

use crate::clock::{Clock, SystemClock};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is half-open, one trial call is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the protected resource (for logging/metrics).
    pub name: String,
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to stay open before allowing a trial call.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Circuit breaker error.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a half-open trial is already running); the call was not made.
    Open,
    /// The call was made and failed.
    Execution(E),
}

impl<E> CircuitBreakerError<E> {
    /// Returns the execution error, if the call was made.
    pub fn into_execution(self) -> Option<E> {
        match self {
            Self::Execution(e) => Some(e),
            Self::Open => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Circuit breaker is open"),
            Self::Execution(e) => write!(f, "Execution failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every open and close. Outcomes of calls admitted under an
    /// older generation are not applied to the state machine.
    generation: u64,
}

/// How a call was let through, tagged with the generation it was admitted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal(u64),
    Trial(u64),
}

/// Frees the half-open trial slot if the trial future is dropped before it
/// reports an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen && inner.generation == self.generation {
                debug!(name = %self.breaker.config.name, "Half-open trial abandoned");
                inner.trial_in_flight = false;
            }
        }
    }
}

/// Circuit breaker for one named resource, shared by all of its callers.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitBreakerState>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a circuit breaker reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            timeout = ?config.timeout,
            "Circuit breaker initialized"
        );

        Arc::new(Self {
            config,
            clock,
            inner: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
                generation: 0,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call made now would be let through.
    pub fn is_call_permitted(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Execute a function with circuit breaker protection. Every error counts
    /// as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_if(f, |_| true).await
    }

    /// Execute a function, counting only errors accepted by `is_failure`
    /// against the circuit. Other errors are returned but recorded as success.
    pub async fn call_if<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let Some(admission) = self.admit() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(name = %self.config.name, "Circuit breaker rejected call");
            return Err(CircuitBreakerError::Open);
        };

        let mut guard = match admission {
            Admission::Trial(generation) => TrialGuard {
                breaker: self,
                generation,
                armed: true,
            },
            Admission::Normal(generation) => TrialGuard {
                breaker: self,
                generation,
                armed: false,
            },
        };
        let result = f().await;
        guard.disarm();

        match result {
            Ok(value) => {
                self.settle(admission, false);
                Ok(value)
            }
            Err(e) => {
                let failed = is_failure(&e);
                self.settle(admission, failed);
                Err(CircuitBreakerError::Execution(e))
            }
        }
    }

    /// Apply the outcome of an admitted call.
    ///
    /// A normal call only counts while the circuit is still closed in the
    /// generation it was admitted in. Only the trial decides a half-open
    /// circuit.
    fn settle(&self, admission: Admission, failed: bool) {
        if failed {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock();
        match admission {
            Admission::Normal(generation)
                if inner.state == CircuitState::Closed && inner.generation == generation =>
            {
                self.apply_closed(&mut inner, failed);
            }
            Admission::Trial(generation)
                if inner.state == CircuitState::HalfOpen && inner.generation == generation =>
            {
                if failed {
                    self.open(&mut inner);
                } else {
                    self.close(&mut inner);
                }
            }
            _ => {
                debug!(
                    name = %self.config.name,
                    state = %inner.state,
                    "Ignoring outcome of call admitted before the last transition"
                );
            }
        }
    }

    fn apply_closed(&self, inner: &mut CircuitBreakerState, failed: bool) {
        if !failed {
            inner.failure_count = 0;
            return;
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        if inner.failure_count >= self.config.failure_threshold {
            self.open(inner);
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => self.close(&mut inner),
            CircuitState::Open => {
                debug!(name = %self.config.name, "Success recorded while circuit open");
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => self.apply_closed(&mut inner, true),
            // A failed trial reopens the circuit and restarts the timeout.
            CircuitState::HalfOpen => self.open(&mut inner),
            CircuitState::Open => {}
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }

    /// Manually force the circuit open.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner);
    }

    /// Get the current failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: self.state(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            current_failure_count: self.failure_count(),
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal(inner.generation)),
            CircuitState::Open => None,
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(Admission::Trial(inner.generation))
            }
        }
    }

    /// Open → half-open once the timeout has elapsed.
    fn refresh(&self, inner: &mut CircuitBreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }

        if let Some(opened_at) = inner.opened_at
            && self.clock.now().saturating_duration_since(opened_at) >= self.config.timeout
        {
            debug!(name = %self.config.name, "Circuit breaker transitioning to HALF-OPEN");
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    fn open(&self, inner: &mut CircuitBreakerState) {
        warn!(
            name = %self.config.name,
            failures = inner.failure_count,
            "Circuit breaker OPENED"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(self.clock.now());
        inner.trial_in_flight = false;
        inner.generation = inner.generation.wrapping_add(1);
    }

    fn close(&self, inner: &mut CircuitBreakerState) {
        if inner.state != CircuitState::Closed {
            info!(name = %self.config.name, "Circuit breaker CLOSED");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.generation = inner.generation.wrapping_add(1);
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Total calls attempted.
    pub total_requests: u64,
    /// Total successes.
    pub total_successes: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Total rejections.
    pub total_rejections: u64,
    /// Consecutive failures counted in the closed state.
    pub current_failure_count: u32,
}

impl CircuitBreakerStats {
    /// Calculate failure rate (0.0 - 1.0) over calls that were made.
    pub fn failure_rate(&self) -> f64 {
        let executed = self.total_successes + self.total_failures;
        if executed == 0 {
            0.0
        } else {
            self.total_failures as f64 / executed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicU32;

    fn breaker(threshold: u32, timeout: Duration) -> (Arc<CircuitBreaker>, ManualClock) {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::with_clock(
            CircuitBreakerConfig::new("test")
                .failure_threshold(threshold)
                .timeout(timeout),
            Arc::new(clock.clone()),
        );
        (cb, clock)
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let (cb, _clock) = breaker(3, Duration::from_secs(30));

        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..3 {
            let _: Result<(), CircuitBreakerError<&str>> = cb.call(|| async { Err("error") }).await;
        }

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_function() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        let _: Result<(), _> = cb.call(|| async { Err::<(), _>("error") }).await;

        for _ in 0..5 {
            let result: Result<(), CircuitBreakerError<&str>> = cb
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Open)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(9));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().total_rejections, 5);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (cb, _clock) = breaker(3, Duration::from_secs(30));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_allows_exactly_one_trial() {
        let (cb, clock) = breaker(2, Duration::from_secs(10));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(10));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = wait.await;
                    Ok::<_, &str>("trial")
                })
                .await
        });

        for _ in 0..100 {
            if !cb.is_call_permitted() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let calls = AtomicU32::new(0);
        let second: Result<&str, CircuitBreakerError<&str>> = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("second")
            })
            .await;
        assert!(matches!(second, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        release.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_and_restarts_timeout() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        cb.record_failure();

        clock.advance(Duration::from_secs(10));
        let result: Result<(), _> = cb.call(|| async { Err::<(), _>("still down") }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Execution("still down"))));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_abandoned_trial_frees_slot() {
        let (cb, clock) = breaker(1, Duration::from_secs(1));
        cb.record_failure();
        clock.advance(Duration::from_secs(1));

        {
            let pending = cb.call(|| std::future::pending::<Result<(), &str>>());
            let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_call_permitted());
    }

    async fn held_call(cb: Arc<CircuitBreaker>, outcome: Result<(), &'static str>) -> (
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<(), CircuitBreakerError<&'static str>>>,
    ) {
        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            cb.call(|| async move {
                let _ = started_tx.send(());
                let _ = wait.await;
                outcome
            })
            .await
        });
        started_rx.await.unwrap();
        (release, handle)
    }

    #[tokio::test]
    async fn test_late_success_from_closed_period_does_not_close_half_open() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        let (release, slow) = held_call(cb.clone(), Ok(())).await;

        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap();

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_call_permitted());
    }

    #[tokio::test]
    async fn test_late_failure_from_closed_period_does_not_reopen_half_open() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        let (release, slow) = held_call(cb.clone(), Err("slow failure")).await;

        cb.record_failure();
        clock.advance(Duration::from_secs(10));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        release.send(()).unwrap();
        assert!(matches!(
            slow.await.unwrap(),
            Err(CircuitBreakerError::Execution("slow failure"))
        ));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let trial: Result<(), CircuitBreakerError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(trial.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unclassified_errors_do_not_trip() {
        let (cb, _clock) = breaker(1, Duration::from_secs(30));

        let result: Result<(), _> = cb
            .call_if(|| async { Err::<(), _>("bad input") }, |_| false)
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Execution(_))));
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
