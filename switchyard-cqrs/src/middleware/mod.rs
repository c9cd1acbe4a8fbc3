//! Middleware pipeline shared by the command and query buses
//!
//! Middlewares wrap each other in registration order: the first registered
//! sees the envelope first and the result last. Each middleware may
//! short-circuit by returning without calling [`Next::run`], or call it more
//! than once (retry).

mod cache;
mod idempotency;
mod logging;
mod metrics;
mod resilience;
mod transaction;
mod validation;

pub use cache::{CacheInvalidationMiddleware, QueryCacheMiddleware};
pub use idempotency::IdempotencyMiddleware;
pub use logging::LoggingMiddleware;
pub use metrics::{DISPATCH_DURATION, DISPATCH_IN_FLIGHT, DISPATCH_TOTAL, MetricsMiddleware};
pub use resilience::{
    BulkheadMiddleware, CircuitBreakerMiddleware, FallbackMiddleware, RetryMiddleware,
    TimeoutMiddleware,
};
pub use transaction::TransactionMiddleware;
pub use validation::ValidationMiddleware;

use crate::envelope::Envelope;
use crate::error::DispatchResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, trace};

/// Innermost step of the chain: the handler invocation.
pub type Terminal = Arc<dyn Fn(Envelope) -> BoxFuture<'static, DispatchResult> + Send + Sync>;

/// Middleware trait for processing envelopes before they reach the handler
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the envelope and optionally pass it to the next middleware
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str;
}

/// The rest of the chain after the current middleware.
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    terminal: Terminal,
}

impl Next {
    /// Run the remaining middlewares and the handler.
    pub fn run(self, envelope: Envelope) -> BoxFuture<'static, DispatchResult> {
        match self.middlewares.get(self.index).cloned() {
            Some(middleware) => {
                trace!(
                    middleware_index = self.index,
                    middleware = middleware.name(),
                    "Executing middleware"
                );
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                Box::pin(async move { middleware.handle(envelope, next).await })
            }
            None => {
                trace!("Middleware chain complete, calling handler");
                (self.terminal)(envelope)
            }
        }
    }
}

/// Middleware chain executor
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware to the end of the chain
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Middleware names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Freeze the chain for execution.
    pub(crate) fn freeze(self) -> FrozenChain {
        FrozenChain {
            middlewares: self.middlewares.into(),
        }
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Immutable chain owned by a bus.
#[derive(Clone)]
pub(crate) struct FrozenChain {
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl FrozenChain {
    /// Execute the middleware chain with a handler
    pub(crate) async fn execute(&self, envelope: Envelope, terminal: Terminal) -> DispatchResult {
        debug!(
            middleware_count = self.middlewares.len(),
            message_type = envelope.message_type(),
            kind = %envelope.kind(),
            "Executing middleware chain"
        );
        Next {
            middlewares: Arc::clone(&self.middlewares),
            index: 0,
            terminal,
        }
        .run(envelope)
        .await
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }
}
