//! Event definitions and traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use uuid::Uuid;

/// Event trait
///
/// An event is an immutable fact. All events must implement this trait to be
/// published through the event bus; [`impl_event!`](crate::impl_event) derives
/// it from an [`EventMetadata`] field.
pub trait Event: Send + Sync + Debug + 'static {
    /// Get event name
    fn event_name(&self) -> &str;

    /// Get event ID
    fn event_id(&self) -> Uuid;

    /// When the fact happened
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Cast to Any for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Clone the event (box clone pattern)
    fn clone_event(&self) -> Box<dyn Event>;
}

/// Implement [`Event`] for a `Clone` type carrying an [`EventMetadata`] field.
///
/// ```rust,ignore
/// #[derive(Debug, Clone)]
/// struct OrderPlaced {
///     metadata: EventMetadata,
///     order_id: String,
/// }
///
/// impl_event!(OrderPlaced, metadata);
/// ```
#[macro_export]
macro_rules! impl_event {
    ($ty:ty, $field:ident) => {
        impl $crate::Event for $ty {
            fn event_name(&self) -> &str {
                &self.$field.name
            }

            fn event_id(&self) -> $crate::__private::Uuid {
                self.$field.id
            }

            fn occurred_at(&self) -> $crate::__private::DateTime<$crate::__private::Utc> {
                self.$field.occurred_at
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn clone_event(&self) -> Box<dyn $crate::Event> {
                Box::new(self.clone())
            }
        }
    };
}

/// Base event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub id: Uuid,

    /// Event name/type
    pub name: String,

    /// When the event happened
    pub occurred_at: DateTime<Utc>,

    /// Optional correlation ID for tracing
    pub correlation_id: Option<Uuid>,

    /// Optional causation ID (ID of the message that caused this event)
    pub causation_id: Option<Uuid>,

    /// Custom metadata
    pub metadata: serde_json::Value,
}

impl EventMetadata {
    /// Create new event metadata stamped with the current time
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            occurred_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set causation ID
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }
}

/// Schemaless domain event emitted by an aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event metadata
    #[serde(flatten)]
    pub metadata: EventMetadata,

    /// Aggregate ID
    pub aggregate_id: String,

    /// Aggregate type
    pub aggregate_type: String,

    /// Event payload
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Create new domain event
    pub fn new(
        event_name: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            metadata: EventMetadata::new(event_name),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            payload,
        }
    }
}

crate::impl_event!(DomainEvent, metadata);

/// Event handler trait
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Handle the event
    async fn handle(&self, event: &E) -> Result<(), EventError>;

    /// Name reported when this handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Failure of a single event handler
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event processing error: {0}")]
    ProcessingError(String),

    #[error("Handler expected {expected} but received {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// One handler's failure within a publish.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler_name: String,
    pub error: EventError,
}

/// Aggregate of every handler failure for one published event.
#[derive(Debug, Clone)]
pub struct EventHandlerError {
    pub event_name: String,
    pub event_id: Uuid,
    /// Failures in subscription order.
    pub failures: Vec<HandlerFailure>,
}

impl EventHandlerError {
    /// Names of the handlers that failed.
    pub fn handler_names(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|f| f.handler_name.as_str())
            .collect()
    }
}

impl std::fmt::Display for EventHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} handler(s) failed for event '{}':",
            self.failures.len(),
            self.event_name
        )?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.handler_name, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for EventHandlerError {}

/// Type-erased event handler
#[async_trait]
pub trait DynEventHandler: Send + Sync {
    /// Handle event (type-erased)
    async fn handle_dyn(&self, event: &dyn Event) -> Result<(), EventError>;

    /// Name reported when this handler fails.
    fn name(&self) -> &str;
}

/// Wrapper for typed event handlers
pub struct TypedEventHandler<E: Event, H: EventHandler<E>> {
    handler: H,
    name: Option<String>,
    _phantom: std::marker::PhantomData<fn(&E)>,
}

impl<E: Event, H: EventHandler<E>> TypedEventHandler<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            name: None,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Override the reported handler name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl<E: Event, H: EventHandler<E> + 'static> DynEventHandler for TypedEventHandler<E, H> {
    async fn handle_dyn(&self, event: &dyn Event) -> Result<(), EventError> {
        match event.as_any().downcast_ref::<E>() {
            Some(typed_event) => self.handler.handle(typed_event).await,
            None => Err(EventError::TypeMismatch {
                expected: std::any::type_name::<E>(),
                actual: event.event_name().to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.handler.name())
    }
}
