// Switchyard - in-process message dispatch for Rust services
//
// Command, query and event buses with a middleware pipeline, resilience
// primitives and caching. Each concern lives in its own crate; this crate
// re-exports them together with configuration and logging setup.

pub mod config;
pub mod logging;

// Re-export member crates
pub use switchyard_cache as cache;
pub use switchyard_cqrs as cqrs;
pub use switchyard_events as events;
pub use switchyard_resilience as resilience;

pub use config::{ConfigError, SwitchyardConfig};
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};

// Prelude for common imports
pub mod prelude {
    pub use crate::config::SwitchyardConfig;
    pub use crate::logging::LogConfig;
    pub use switchyard_cache::{JitterConfig, JitteredCache};
    pub use switchyard_cqrs::{
        BulkheadMiddleware, CacheInvalidationMiddleware, CircuitBreakerMiddleware, Command,
        CommandBus, CommandHandler, DispatchContext, DispatchError, FallbackMiddleware,
        HandlerError, IdempotencyMiddleware, IdempotencyStore, LoggingMiddleware, Message,
        MetricsMiddleware, Middleware, Next, PrometheusMetrics, Query, QueryBus,
        QueryCacheMiddleware, QueryHandler, RetryMiddleware, TimeoutMiddleware,
        TransactionMiddleware, ValidationErrors, ValidationMiddleware,
    };
    pub use switchyard_events::{
        DomainEvent, Event, EventBus, EventError, EventHandler, EventMetadata, impl_event,
    };
    pub use switchyard_resilience::{
        BulkheadConfig, CircuitBreakerConfig, RetryConfig, TimeoutConfig,
    };
}
