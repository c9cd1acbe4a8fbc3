//! Message contracts for commands and queries

use crate::validation::ValidationErrors;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

/// Base contract shared by commands and queries.
///
/// The message is serialized once per dispatch to fingerprint it for
/// idempotency and cache keys, and its result travels through the pipeline as
/// JSON so middlewares can store and replay it.
pub trait Message: Clone + Serialize + Send + Sync + 'static {
    /// Result type returned by the handler
    type Result: Serialize + DeserializeOwned + Send + 'static;

    /// Stable name used in logs, metrics and derived keys.
    fn message_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Check the message before it reaches the handler.
    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }
}

/// Command trait
///
/// Commands represent write operations that change system state.
pub trait Command: Message {
    /// Key under which repeated submissions are deduplicated.
    fn idempotency_key(&self) -> Option<String> {
        None
    }

    /// Cache tags to invalidate after the command succeeds.
    fn invalidates(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Query trait
///
/// Queries represent read operations that don't change system state.
pub trait Query: Message {
    /// Cache results for this long. `None` disables caching.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    /// Explicit cache key. Defaults to a hash of the serialized query.
    fn cache_key(&self) -> Option<String> {
        None
    }
}

/// Which bus a message travels through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Query,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Query => "query",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
