//! Event Bus implementation

use crate::event::{
    DynEventHandler, Event, EventError, EventHandler, EventHandlerError, HandlerFailure,
    TypedEventHandler,
};
use dashmap::DashMap;
use futures::FutureExt;
use std::any::{Any, TypeId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Event bus for in-process event publishing and handling
///
/// Every handler subscribed to an event type runs on each publish, whatever
/// its siblings do. Failures are collected and reported together once all
/// handlers have finished.
#[derive(Clone)]
pub struct EventBus {
    /// Handlers registered for each event type, in subscription order
    handlers: Arc<DashMap<TypeId, Vec<Arc<dyn DynEventHandler>>>>,

    /// Configuration
    config: Arc<EventBusConfig>,
}

/// Event bus configuration
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Run handlers concurrently, one task each, instead of in order
    pub concurrent: bool,

    /// Enable event logging
    pub enable_logging: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            concurrent: false,
            enable_logging: true,
        }
    }
}

impl EventBus {
    /// Create new event bus
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create event bus with custom config
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Subscribe a handler to an event type
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let bus = EventBus::new();
    /// bus.subscribe::<OrderPlaced, _>(SendReceipt::new(mailer));
    /// ```
    pub fn subscribe<E, H>(&self, handler: H)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.subscribe_dyn::<E>(Arc::new(TypedEventHandler::new(handler)));
    }

    /// Subscribe a handler under an explicit name
    pub fn subscribe_named<E, H>(&self, name: impl Into<String>, handler: H)
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.subscribe_dyn::<E>(Arc::new(TypedEventHandler::new(handler).named(name)));
    }

    /// Subscribe an already type-erased handler
    pub fn subscribe_dyn<E: Event>(&self, handler: Arc<dyn DynEventHandler>) {
        let type_id = TypeId::of::<E>();

        if self.config.enable_logging {
            debug!(
                event_type = std::any::type_name::<E>(),
                handler = handler.name(),
                "Subscribed event handler"
            );
        }

        self.handlers.entry(type_id).or_default().push(handler);
    }

    /// Publish an event
    ///
    /// All registered handlers for this event type will be invoked.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let bus = EventBus::new();
    /// if let Err(failures) = bus.publish(OrderPlaced::new("o-1")).await {
    ///     for failure in &failures.failures {
    ///         eprintln!("{} failed: {}", failure.handler_name, failure.error);
    ///     }
    /// }
    /// ```
    pub async fn publish<E: Event>(&self, event: E) -> Result<(), EventHandlerError> {
        self.publish_dyn(Arc::new(event)).await
    }

    /// Publish a type-erased event, routed by its concrete type
    pub async fn publish_dyn(&self, event: Arc<dyn Event>) -> Result<(), EventHandlerError> {
        let type_id = event.as_any().type_id();

        if self.config.enable_logging {
            info!(
                event = event.event_name(),
                event_id = %event.event_id(),
                "Publishing event"
            );
        }

        // Clone the list so no map guard is held while handlers run.
        let handlers = match self.handlers.get(&type_id) {
            Some(handlers) => handlers.clone(),
            None => {
                if self.config.enable_logging {
                    debug!(event = event.event_name(), "No handlers registered for event");
                }
                return Ok(());
            }
        };

        let outcomes = if self.config.concurrent {
            Self::run_concurrently(&handlers, &event).await
        } else {
            Self::run_sequentially(&handlers, &event).await
        };

        let failures: Vec<HandlerFailure> = handlers
            .iter()
            .zip(outcomes)
            .filter_map(|(handler, outcome)| {
                outcome.err().map(|error| HandlerFailure {
                    handler_name: handler.name().to_string(),
                    error,
                })
            })
            .collect();

        if failures.is_empty() {
            if self.config.enable_logging {
                debug!(
                    event = event.event_name(),
                    handlers = handlers.len(),
                    "Event published successfully"
                );
            }
            return Ok(());
        }

        for failure in &failures {
            error!(
                event = event.event_name(),
                handler = %failure.handler_name,
                error = %failure.error,
                "Event handler failed"
            );
        }
        warn!(
            event = event.event_name(),
            failed = failures.len(),
            total = handlers.len(),
            "Event delivery partially failed"
        );

        Err(EventHandlerError {
            event_name: event.event_name().to_string(),
            event_id: event.event_id(),
            failures,
        })
    }

    async fn run_sequentially(
        handlers: &[Arc<dyn DynEventHandler>],
        event: &Arc<dyn Event>,
    ) -> Vec<Result<(), EventError>> {
        let mut outcomes = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle_dyn(event.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(EventError::Panicked(panic_message(&*panic))));
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_concurrently(
        handlers: &[Arc<dyn DynEventHandler>],
        event: &Arc<dyn Event>,
    ) -> Vec<Result<(), EventError>> {
        let tasks: Vec<_> = handlers
            .iter()
            .map(|handler| {
                let handler = Arc::clone(handler);
                let event = Arc::clone(event);
                tokio::spawn(async move { handler.handle_dyn(event.as_ref()).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(EventError::Panicked(e.to_string())),
            });
        }
        outcomes
    }

    /// Unsubscribe all handlers for an event type
    pub fn unsubscribe<E: Event>(&self) -> usize {
        let removed = self
            .handlers
            .remove(&TypeId::of::<E>())
            .map(|(_, handlers)| handlers.len())
            .unwrap_or(0);

        if self.config.enable_logging {
            debug!(
                event_type = std::any::type_name::<E>(),
                removed, "Unsubscribed event handlers"
            );
        }
        removed
    }

    /// Clear all handlers
    pub fn clear(&self) {
        self.handlers.clear();
        if self.config.enable_logging {
            info!("Cleared all event handlers");
        }
    }

    /// Get handler count for an event type
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .get(&TypeId::of::<E>())
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.handlers.len())
            .field("config", &self.config)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Event bus builder
#[derive(Debug, Default)]
pub struct EventBusBuilder {
    config: EventBusConfig,
}

impl EventBusBuilder {
    /// Create new event bus builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Run handlers concurrently
    pub fn concurrent(mut self, enabled: bool) -> Self {
        self.config.concurrent = enabled;
        self
    }

    /// Enable/disable logging
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    /// Build the event bus
    pub fn build(self) -> EventBus {
        EventBus::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, EventMetadata};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone)]
    struct OrderPlaced {
        metadata: EventMetadata,
        order_id: String,
    }

    crate::impl_event!(OrderPlaced, metadata);

    impl OrderPlaced {
        fn new(order_id: &str) -> Self {
            Self {
                metadata: EventMetadata::new("order_placed"),
                order_id: order_id.to_string(),
            }
        }
    }

    #[derive(Clone)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        label: &'static str,
        fail: bool,
    }

    impl Recorder {
        fn new(label: &'static str, seen: &Arc<Mutex<Vec<String>>>, fail: bool) -> Self {
            Self {
                seen: Arc::clone(seen),
                label,
                fail,
            }
        }
    }

    #[async_trait]
    impl EventHandler<OrderPlaced> for Recorder {
        async fn handle(&self, event: &OrderPlaced) -> Result<(), EventError> {
            self.seen
                .lock()
                .push(format!("{}:{}", self.label, event.order_id));
            if self.fail {
                Err(EventError::HandlerFailed(format!("{} refused", self.label)))
            } else {
                Ok(())
            }
        }
    }

    struct Panicker;

    #[async_trait]
    impl EventHandler<OrderPlaced> for Panicker {
        async fn handle(&self, _event: &OrderPlaced) -> Result<(), EventError> {
            panic!("handler bug");
        }
    }

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl EventHandler<DomainEvent> for Counter {
        async fn handle(&self, _event: &DomainEvent) -> Result<(), EventError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn subscribe_mixed(bus: &EventBus, seen: &Arc<Mutex<Vec<String>>>) {
        bus.subscribe_named::<OrderPlaced, _>("h1", Recorder::new("h1", seen, true));
        bus.subscribe_named::<OrderPlaced, _>("h2", Recorder::new("h2", seen, false));
        bus.subscribe_named::<OrderPlaced, _>("h3", Recorder::new("h3", seen, true));
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_siblings() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        subscribe_mixed(&bus, &seen);

        let err = bus.publish(OrderPlaced::new("o-1")).await.unwrap_err();

        assert_eq!(*seen.lock(), vec!["h1:o-1", "h2:o-1", "h3:o-1"]);
        assert_eq!(err.handler_names(), vec!["h1", "h3"]);
        assert_eq!(err.event_name, "order_placed");
    }

    #[tokio::test]
    async fn test_concurrent_mode_aggregates_the_same_failures() {
        let bus = EventBusBuilder::new().concurrent(true).build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        subscribe_mixed(&bus, &seen);

        let err = bus.publish(OrderPlaced::new("o-2")).await.unwrap_err();

        assert_eq!(seen.lock().len(), 3);
        assert_eq!(err.handler_names(), vec!["h1", "h3"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_named::<OrderPlaced, _>("panics", Panicker);
        bus.subscribe_named::<OrderPlaced, _>("after", Recorder::new("after", &seen, false));

        let err = bus.publish(OrderPlaced::new("o-3")).await.unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].handler_name, "panics");
        assert!(matches!(err.failures[0].error, EventError::Panicked(ref m) if m == "handler bug"));
        assert_eq!(*seen.lock(), vec!["after:o-3"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = EventBus::new();
        assert!(bus.publish(OrderPlaced::new("o-4")).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_dyn_routes_by_concrete_type() {
        let bus = EventBus::new();
        let counter = Counter::default();
        bus.subscribe::<DomainEvent, _>(counter.clone());

        let event: Arc<dyn Event> = Arc::new(DomainEvent::new(
            "user_created",
            "user-1",
            "User",
            serde_json::json!({"name": "Alice"}),
        ));
        bus.publish_dyn(event).await.unwrap();
        bus.publish(OrderPlaced::new("ignored")).await.unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_count_and_unsubscribe() {
        let bus = EventBus::new();
        assert_eq!(bus.handler_count::<DomainEvent>(), 0);

        bus.subscribe::<DomainEvent, _>(Counter::default());
        bus.subscribe::<DomainEvent, _>(Counter::default());
        assert_eq!(bus.handler_count::<DomainEvent>(), 2);

        assert_eq!(bus.unsubscribe::<DomainEvent>(), 2);
        assert_eq!(bus.handler_count::<DomainEvent>(), 0);
    }
}
