//! Queries and the query bus

use crate::context::DispatchContext;
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult, HandlerError};
use crate::message::Query;
use crate::middleware::{FrozenChain, Middleware, MiddlewareChain, QueryCacheMiddleware};
use crate::registry::{DynHandler, HandlerRegistry, mismatched, terminal};
use async_trait::async_trait;
use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use switchyard_cache::JitteredCache;
use tracing::{debug, info};

/// Query handler trait
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    /// Handle the query
    async fn handle(&self, query: Q, ctx: &DispatchContext) -> Result<Q::Result, HandlerError>;
}

/// Wrapper for typed query handlers
struct TypedQueryHandler<Q, H> {
    handler: H,
    _phantom: PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q> + 'static> DynHandler for TypedQueryHandler<Q, H> {
    async fn handle_dyn(&self, envelope: Envelope) -> DispatchResult {
        let query = envelope
            .message::<Q>()
            .cloned()
            .ok_or_else(|| mismatched(Q::message_name(), &envelope))?;
        let result = self.handler.handle(query, envelope.context()).await?;
        Ok(serde_json::to_value(result)?)
    }
}

struct QueryBusInner {
    handlers: HandlerRegistry,
    chain: FrozenChain,
}

/// Query bus for dispatching queries to handlers
#[derive(Clone)]
pub struct QueryBus {
    inner: Arc<QueryBusInner>,
}

impl QueryBus {
    /// Create a query bus without middleware or caching.
    pub fn new() -> Self {
        QueryBusBuilder::new().build()
    }

    /// Start configuring a query bus.
    pub fn builder() -> QueryBusBuilder {
        QueryBusBuilder::new()
    }

    /// Register a query handler
    pub fn register<Q, H>(&self, handler: H) -> Result<(), DispatchError>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let wrapper = TypedQueryHandler {
            handler,
            _phantom: PhantomData,
        };
        self.inner
            .handlers
            .register(TypeId::of::<Q>(), Q::message_name(), Arc::new(wrapper))?;
        info!(query_type = Q::message_name(), "Registered query handler");
        Ok(())
    }

    /// Remove the handler for `Q`. Returns whether one was registered.
    pub fn unregister<Q: Query>(&self) -> bool {
        self.inner.handlers.unregister(TypeId::of::<Q>())
    }

    pub fn has_handler<Q: Query>(&self) -> bool {
        self.inner.handlers.contains(TypeId::of::<Q>())
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Names of queries with a registered handler, sorted.
    pub fn registered_queries(&self) -> Vec<&'static str> {
        self.inner.handlers.message_types()
    }

    /// Middleware names, outermost first.
    pub fn middleware(&self) -> Vec<&'static str> {
        self.inner.chain.names()
    }

    /// Dispatch a query with a fresh context
    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Q::Result, DispatchError> {
        self.dispatch_with(query, DispatchContext::new()).await
    }

    /// Dispatch a query within `ctx`
    pub async fn dispatch_with<Q: Query>(
        &self,
        query: Q,
        ctx: DispatchContext,
    ) -> Result<Q::Result, DispatchError> {
        let query_type = Q::message_name();
        let handler = self
            .inner
            .handlers
            .get(TypeId::of::<Q>())
            .ok_or_else(|| DispatchError::HandlerNotFound {
                message_type: query_type.to_string(),
            })?;

        debug!(query_type, request_id = %ctx.request_id(), "Dispatching query");

        let envelope = Envelope::for_query(query, ctx)?;
        let value = self.inner.chain.execute(envelope, terminal(handler)).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBus")
            .field("handlers", &self.inner.handlers.message_types())
            .field("middleware", &self.inner.chain.names())
            .finish()
    }
}

/// Builder for query buses
#[derive(Default)]
pub struct QueryBusBuilder {
    chain: MiddlewareChain,
    cache: Option<JitteredCache>,
}

impl QueryBusBuilder {
    /// Create a builder with an empty middleware chain and no cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. The first added is the outermost.
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.chain.push(Arc::new(middleware));
        self
    }

    /// Append a shared middleware.
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.chain.push(middleware);
        self
    }

    /// Cache results of queries with a TTL. The cache runs innermost, next
    /// to the handler.
    pub fn cache(mut self, cache: JitteredCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Freeze the middleware chain and create the bus.
    pub fn build(self) -> QueryBus {
        let mut chain = self.chain;
        if let Some(cache) = self.cache {
            chain.push(Arc::new(QueryCacheMiddleware::new(cache)));
        }
        QueryBus {
            inner: Arc::new(QueryBusInner {
                handlers: HandlerRegistry::default(),
                chain: chain.freeze(),
            }),
        }
    }
}
