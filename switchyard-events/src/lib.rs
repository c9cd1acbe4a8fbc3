//! In-process event publishing for Switchyard
//!
//! Events are broadcast to every handler subscribed to their type. Delivery
//! is best-effort to all: a failing or panicking handler never prevents its
//! siblings from running, and `publish` reports every failure at once.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchyard_events::*;
//! use async_trait::async_trait;
//!
//! #[derive(Debug, Clone)]
//! struct UserCreated {
//!     metadata: EventMetadata,
//!     email: String,
//! }
//!
//! impl_event!(UserCreated, metadata);
//!
//! struct WelcomeEmail;
//!
//! #[async_trait]
//! impl EventHandler<UserCreated> for WelcomeEmail {
//!     async fn handle(&self, event: &UserCreated) -> Result<(), EventError> {
//!         send_welcome(&event.email).await.map_err(|e| EventError::HandlerFailed(e.to_string()))
//!     }
//! }
//!
//! let bus = EventBus::new();
//! bus.subscribe::<UserCreated, _>(WelcomeEmail);
//! bus.publish(UserCreated { metadata: EventMetadata::new("user_created"), email }).await?;
//! ```
//!
//! ## Configuration
//!
//! ```rust,ignore
//! let bus = EventBusBuilder::new()
//!     .concurrent(true)        // One task per handler
//!     .enable_logging(false)
//!     .build();
//! ```

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventBusBuilder, EventBusConfig};
pub use event::{
    DomainEvent, DynEventHandler, Event, EventError, EventHandler, EventHandlerError,
    EventMetadata, HandlerFailure, TypedEventHandler,
};

#[doc(hidden)]
pub mod __private {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
