//! Adapters running the rest of the chain under the resilience primitives

use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult};
use crate::message::Message;
use async_trait::async_trait;
use serde_json::Value;
use std::any::TypeId;
use std::sync::Arc;
use switchyard_resilience::{
    Bulkhead, BulkheadConfig, BulkheadError, BulkheadRegistry, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, Fallback, Retry,
    RetryError, Timeout, TimeoutError,
};

/// Re-runs the rest of the chain while it fails with a retryable error.
///
/// Only [`DispatchError::is_retryable`] errors are retried. When attempts run
/// out the last error is wrapped in [`DispatchError::RetryExhausted`].
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    retry: Retry,
}

impl RetryMiddleware {
    pub fn new(retry: Retry) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        let result = self
            .retry
            .call_if(
                || next.clone().run(envelope.clone()),
                DispatchError::is_retryable,
            )
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => Err(DispatchError::RetryExhausted {
                attempts,
                last: Box::new(last_error),
            }),
            Err(RetryError::Aborted { error, .. }) => Err(error),
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}

/// Where a middleware finds the primitive guarding an envelope.
#[derive(Debug)]
enum Scope<T, R, C> {
    /// One instance shared by every message.
    Shared(Arc<T>),
    /// One instance per message type, created on first use.
    PerMessageType { registry: Arc<R>, template: C },
}

/// Fails fast while the downstream of the chain keeps failing.
///
/// Only errors for which [`DispatchError::counts_toward_circuit`] holds are
/// recorded as failures.
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    scope: Scope<CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerConfig>,
}

impl CircuitBreakerMiddleware {
    /// Guard every message with one breaker.
    pub fn shared(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            scope: Scope::Shared(breaker),
        }
    }

    /// Give each message type its own breaker built from `template`.
    pub fn per_message_type(registry: Arc<CircuitBreakerRegistry>, template: CircuitBreakerConfig) -> Self {
        Self {
            scope: Scope::PerMessageType { registry, template },
        }
    }

    fn breaker_for(&self, envelope: &Envelope) -> Arc<CircuitBreaker> {
        match &self.scope {
            Scope::Shared(breaker) => Arc::clone(breaker),
            Scope::PerMessageType { registry, template } => {
                registry.get_or_create(envelope.message_type(), template)
            }
        }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        let breaker = self.breaker_for(&envelope);

        match breaker
            .call_if(|| next.run(envelope), DispatchError::counts_toward_circuit)
            .await
        {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open) => Err(DispatchError::CircuitOpen {
                resource: breaker.name().to_string(),
            }),
            Err(CircuitBreakerError::Execution(e)) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "circuit_breaker"
    }
}

/// Caps concurrent executions of the rest of the chain.
#[derive(Debug)]
pub struct BulkheadMiddleware {
    scope: Scope<Bulkhead, BulkheadRegistry, BulkheadConfig>,
}

impl BulkheadMiddleware {
    /// Share one bulkhead across every message.
    pub fn shared(bulkhead: Arc<Bulkhead>) -> Self {
        Self {
            scope: Scope::Shared(bulkhead),
        }
    }

    /// Give each message type its own bulkhead built from `template`.
    pub fn per_message_type(registry: Arc<BulkheadRegistry>, template: BulkheadConfig) -> Self {
        Self {
            scope: Scope::PerMessageType { registry, template },
        }
    }

    fn bulkhead_for(&self, envelope: &Envelope) -> Arc<Bulkhead> {
        match &self.scope {
            Scope::Shared(bulkhead) => Arc::clone(bulkhead),
            Scope::PerMessageType { registry, template } => {
                registry.get_or_create(envelope.message_type(), template)
            }
        }
    }
}

#[async_trait]
impl Middleware for BulkheadMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        let bulkhead = self.bulkhead_for(&envelope);

        match bulkhead.call(|| next.run(envelope)).await {
            Ok(value) => Ok(value),
            Err(BulkheadError::Rejected) | Err(BulkheadError::Timeout) => {
                Err(DispatchError::BulkheadRejected {
                    resource: bulkhead.name().to_string(),
                })
            }
            Err(BulkheadError::Execution(e)) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "bulkhead"
    }
}

/// Bounds how long the rest of the chain may run.
///
/// The handler runs on its own task with a child of the dispatch's
/// cancellation token. On expiry the token is cancelled and
/// [`DispatchError::Timeout`] is returned; the handler is not aborted.
#[derive(Debug, Clone)]
pub struct TimeoutMiddleware {
    timeout: Timeout,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Timeout) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn handle(&self, mut envelope: Envelope, next: Next) -> DispatchResult {
        let message_type = envelope.message_type();
        let token = envelope.context().cancellation_token().child_token();
        envelope.context_mut().set_cancellation_token(token.clone());

        match self
            .timeout
            .spawn_cancellable(token, move |_| next.run(envelope))
            .await
        {
            Ok(value) => Ok(value),
            Err(TimeoutError::Execution(e)) => Err(e),
            Err(TimeoutError::Elapsed(after)) => Err(DispatchError::Timeout {
                message_type: message_type.to_string(),
                after,
            }),
            Err(TimeoutError::Panicked(reason)) => Err(DispatchError::middleware(
                self.name(),
                format!("handler panicked: {}", reason),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

type FallbackPredicate = Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>;

/// Substitutes a fallback result when the rest of the chain fails.
///
/// The fallback produces the handler's JSON result, so it is usually scoped
/// to one message type with [`FallbackMiddleware::for_message`].
pub struct FallbackMiddleware {
    fallback: Fallback<Value, DispatchError>,
    message: Option<TypeId>,
    predicate: FallbackPredicate,
}

impl FallbackMiddleware {
    /// Apply `fallback` to every message.
    pub fn new(fallback: Fallback<Value, DispatchError>) -> Self {
        Self {
            fallback,
            message: None,
            predicate: Arc::new(|_| true),
        }
    }

    /// Apply `fallback` to messages of type `M` only.
    pub fn for_message<M: Message>(fallback: Fallback<Value, DispatchError>) -> Self {
        Self {
            message: Some(TypeId::of::<M>()),
            ..Self::new(fallback)
        }
    }

    /// Fall back only on errors accepted by `predicate`.
    pub fn only_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&DispatchError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    fn applies_to(&self, envelope: &Envelope) -> bool {
        self.message
            .is_none_or(|type_id| envelope.message_type_id() == type_id)
    }
}

#[async_trait]
impl Middleware for FallbackMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        if !self.applies_to(&envelope) {
            return next.run(envelope).await;
        }
        let predicate = Arc::clone(&self.predicate);
        self.fallback
            .call_if(|| next.run(envelope), move |e| predicate(e))
            .await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

impl std::fmt::Debug for FallbackMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackMiddleware")
            .field("fallback", &self.fallback)
            .field("scoped", &self.message.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchContext;
    use crate::error::HandlerError;
    use crate::message::{Message, Query};
    use crate::middleware::{FrozenChain, MiddlewareChain, Terminal};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use switchyard_resilience::{RetryConfig, TimeoutConfig};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Lookup;

    impl Message for Lookup {
        type Result = String;
    }

    impl Query for Lookup {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Other;

    impl Message for Other {
        type Result = String;
    }

    impl Query for Other {}

    fn envelope() -> Envelope {
        Envelope::for_query(Lookup, DispatchContext::new()).unwrap()
    }

    fn chain(middleware: impl Middleware + 'static) -> FrozenChain {
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(middleware));
        chain.freeze()
    }

    /// Fails with `error` for the first `failures` calls, then succeeds.
    fn flaky(calls: Arc<AtomicU32>, failures: u32, error: DispatchError) -> Terminal {
        Arc::new(move |_envelope| {
            let calls = Arc::clone(&calls);
            let error = error.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(error)
                } else {
                    Ok(Value::from("ok"))
                }
            })
        })
    }

    fn transient() -> DispatchError {
        HandlerError::Transient("connection reset".into()).into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = chain(RetryMiddleware::new(Retry::new(RetryConfig::new(3).jitter(false))));

        let result = chain
            .execute(envelope(), flaky(Arc::clone(&calls), 2, transient()))
            .await;

        assert_eq!(result.unwrap(), Value::from("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_reports_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = chain(RetryMiddleware::new(Retry::new(RetryConfig::new(3).jitter(false))));

        let result = chain
            .execute(envelope(), flaky(Arc::clone(&calls), u32::MAX, transient()))
            .await;

        match result {
            Err(DispatchError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DispatchError::Handler(HandlerError::Transient(_))));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = chain(RetryMiddleware::new(Retry::new(RetryConfig::new(5))));
        let not_found: DispatchError = HandlerError::NotFound("user".into()).into();

        let result = chain
            .execute(envelope(), flaky(Arc::clone(&calls), u32::MAX, not_found))
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::Handler(HandlerError::NotFound(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let chain = chain(CircuitBreakerMiddleware::per_message_type(
            Arc::clone(&registry),
            CircuitBreakerConfig::default().failure_threshold(3),
        ));
        let failing: DispatchError = HandlerError::ExecutionFailed("db down".into()).into();
        let terminal = flaky(Arc::clone(&calls), u32::MAX, failing);

        for _ in 0..3 {
            assert!(chain.execute(envelope(), terminal.clone()).await.is_err());
        }
        let rejected = chain.execute(envelope(), terminal).await;

        assert!(matches!(
            rejected,
            Err(DispatchError::CircuitOpen { ref resource }) if resource == "Lookup"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(registry.get("Lookup").is_some());
    }

    #[tokio::test]
    async fn test_client_errors_leave_circuit_closed() {
        let calls = Arc::new(AtomicU32::new(0));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("users").failure_threshold(1));
        let chain = chain(CircuitBreakerMiddleware::shared(Arc::clone(&breaker)));
        let not_found: DispatchError = HandlerError::NotFound("user".into()).into();
        let terminal = flaky(Arc::clone(&calls), u32::MAX, not_found);

        for _ in 0..3 {
            let result = chain.execute(envelope(), terminal.clone()).await;
            assert!(matches!(result, Err(DispatchError::Handler(_))));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_bulkhead_rejects_when_full() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("reports", 1).max_queue(0));
        let chain = chain(BulkheadMiddleware::shared(Arc::clone(&bulkhead)));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));
        let blocking: Terminal = Arc::new(move |_envelope| {
            let rx = release_rx.lock().take();
            Box::pin(async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(Value::Null)
            })
        });

        let first_chain = chain.clone();
        let first_terminal = blocking.clone();
        let first = tokio::spawn(async move { first_chain.execute(envelope(), first_terminal).await });
        while bulkhead.active_count() == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = chain.execute(envelope(), blocking).await;
        assert!(matches!(
            rejected,
            Err(DispatchError::BulkheadRejected { ref resource }) if resource == "reports"
        ));

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_handler_token() {
        let chain = chain(TimeoutMiddleware::new(Timeout::new(
            TimeoutConfig::new(Duration::from_millis(100)).name("lookup"),
        )));
        let (observed_tx, observed_rx) = tokio::sync::oneshot::channel::<()>();
        let observed_tx = Arc::new(parking_lot::Mutex::new(Some(observed_tx)));
        let outer = DispatchContext::new();
        let outer_token = outer.cancellation_token().clone();
        let slow: Terminal = Arc::new(move |envelope: Envelope| {
            let observed_tx = observed_tx.lock().take();
            let token = envelope.context().cancellation_token().clone();
            Box::pin(async move {
                token.cancelled().await;
                if let Some(tx) = observed_tx {
                    let _ = tx.send(());
                }
                Ok(Value::Null)
            })
        });

        let result = chain
            .execute(Envelope::for_query(Lookup, outer).unwrap(), slow)
            .await;

        assert!(matches!(
            result,
            Err(DispatchError::Timeout { ref message_type, .. }) if message_type == "Lookup"
        ));
        observed_rx.await.unwrap();
        assert!(!outer_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_fallback_is_scoped_to_message_type() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = chain(FallbackMiddleware::for_message::<Lookup>(Fallback::value(
            Value::from("cached"),
        )));
        let terminal = flaky(Arc::clone(&calls), u32::MAX, transient());

        let recovered = chain.execute(envelope(), terminal.clone()).await;
        let other = chain
            .execute(
                Envelope::for_query(Other, DispatchContext::new()).unwrap(),
                terminal,
            )
            .await;

        assert_eq!(recovered.unwrap(), Value::from("cached"));
        assert!(other.is_err());
    }

    #[tokio::test]
    async fn test_fallback_predicate_filters_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let chain = chain(
            FallbackMiddleware::new(Fallback::value(Value::from("cached")))
                .only_if(DispatchError::is_retryable),
        );
        let not_found: DispatchError = HandlerError::NotFound("user".into()).into();

        let result = chain
            .execute(envelope(), flaky(Arc::clone(&calls), u32::MAX, not_found))
            .await;

        assert!(result.is_err());
    }
}
