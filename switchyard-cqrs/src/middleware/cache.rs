use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::DispatchResult;
use crate::message::MessageKind;
use async_trait::async_trait;
use switchyard_cache::JitteredCache;
use tracing::{debug, warn};

/// Serves query results from a [`JitteredCache`].
///
/// Only queries with a cache policy are cached. Misses compute through the
/// rest of the chain under the cache's stampede lock, and each entry is
/// tagged with the query's message name.
#[derive(Debug, Clone)]
pub struct QueryCacheMiddleware {
    cache: JitteredCache,
}

impl QueryCacheMiddleware {
    pub fn new(cache: JitteredCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Middleware for QueryCacheMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        let policy = match (envelope.kind(), envelope.cache_policy()) {
            (MessageKind::Query, Some(policy)) => policy.clone(),
            _ => return next.run(envelope).await,
        };

        let compute = move || next.clone().run(envelope.clone());
        self.cache
            .get_or_compute(&policy.key, policy.ttl, &policy.tags, compute)
            .await
    }

    fn name(&self) -> &'static str {
        "query_cache"
    }
}

/// Drops cached query results tagged by a command once it succeeds.
///
/// Invalidation failures are logged; the command's result stands.
#[derive(Debug, Clone)]
pub struct CacheInvalidationMiddleware {
    cache: JitteredCache,
}

impl CacheInvalidationMiddleware {
    pub fn new(cache: JitteredCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Middleware for CacheInvalidationMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        if envelope.kind() != MessageKind::Command || envelope.invalidates().is_empty() {
            return next.run(envelope).await;
        }

        let message_type = envelope.message_type();
        let tags = envelope.invalidates().to_vec();
        let result = next.run(envelope).await;

        if result.is_ok() {
            match self.cache.invalidate_tags(&tags).await {
                Ok(removed) => debug!(message_type, ?tags, removed, "Invalidated cached queries"),
                Err(e) => warn!(message_type, ?tags, error = %e, "Cache invalidation failed"),
            }
        }

        result
    }

    fn name(&self) -> &'static str {
        "cache_invalidation"
    }
}
