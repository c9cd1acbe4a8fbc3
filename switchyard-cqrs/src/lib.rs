//! Command and query buses for Switchyard
//!
//! Commands change state and queries read it. Each message type is bound to
//! exactly one handler, and every dispatch runs through a middleware chain
//! (logging, metrics, validation, transactions, idempotency, resilience,
//! caching) before reaching it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use switchyard_cqrs::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct CreateUser {
//!     email: String,
//! }
//!
//! impl Message for CreateUser {
//!     type Result = String;
//! }
//!
//! impl Command for CreateUser {}
//!
//! struct CreateUserHandler;
//!
//! #[async_trait]
//! impl CommandHandler<CreateUser> for CreateUserHandler {
//!     async fn handle(&self, cmd: CreateUser, ctx: &DispatchContext) -> Result<String, HandlerError> {
//!         Ok(format!("user-for-{}", cmd.email))
//!     }
//! }
//!
//! let bus = CommandBus::builder()
//!     .middleware(LoggingMiddleware::new())
//!     .middleware(ValidationMiddleware::new())
//!     .build();
//! bus.register::<CreateUser, _>(CreateUserHandler)?;
//!
//! let id = bus.dispatch(CreateUser { email: "ada@example.com".into() }).await?;
//! ```

pub mod command;
pub mod context;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod query;
mod registry;
pub mod unit_of_work;
pub mod validation;

pub use command::*;
pub use context::*;
pub use envelope::{CachePolicy, Envelope};
pub use error::*;
pub use idempotency::*;
pub use message::*;
pub use metrics::*;
pub use middleware::*;
pub use query::*;
pub use unit_of_work::*;
pub use validation::*;
