//! Dispatch error types

use crate::validation::ValidationErrors;
use std::time::Duration;
use thiserror::Error;

/// Result of running an envelope through the pipeline.
pub type DispatchResult = Result<serde_json::Value, DispatchError>;

/// Error returned by a command or query handler
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure expected to clear up on its own; eligible for retry.
    #[error("Transient failure: {0}")]
    Transient(String),
}

/// Error returned by the command and query buses
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("No handler registered for {message_type}")]
    HandlerNotFound { message_type: String },

    #[error("A handler is already registered for {message_type}")]
    HandlerAlreadyRegistered { message_type: String },

    #[error("Middleware '{middleware}' failed: {reason}")]
    Middleware { middleware: String, reason: String },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Circuit '{resource}' is open")]
    CircuitOpen { resource: String },

    #[error("Bulkhead '{resource}' rejected the request")]
    BulkheadRejected { resource: String },

    #[error("{message_type} timed out after {after:?}")]
    Timeout { message_type: String, after: Duration },

    #[error("Idempotency key '{key}' was reused with a different request")]
    IdempotencyKeyConflict { key: String },

    #[error("A request with idempotency key '{key}' is still in progress")]
    IdempotencyInProgress { key: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<DispatchError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DispatchError {
    /// Create a middleware error.
    pub fn middleware(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Middleware {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Handler(HandlerError::Transient(_)) | Self::Timeout { .. }
        )
    }

    /// Whether the error indicates an unhealthy downstream.
    ///
    /// Rejections of the request itself (validation, missing entities,
    /// business rules, idempotency conflicts) leave a circuit untouched.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(
            self,
            Self::Handler(HandlerError::ExecutionFailed(_))
                | Self::Handler(HandlerError::Transient(_))
                | Self::Timeout { .. }
                | Self::Middleware { .. }
                | Self::RetryExhausted { .. }
        )
    }

    /// The innermost error, unwrapping retry exhaustion.
    pub fn root_cause(&self) -> &DispatchError {
        match self {
            Self::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

impl From<ValidationErrors> for DispatchError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::from(HandlerError::Transient("db".into())).is_retryable());
        assert!(
            DispatchError::Timeout {
                message_type: "GetOrder".into(),
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(!DispatchError::from(HandlerError::NotFound("order".into())).is_retryable());
        assert!(!DispatchError::Validation(ValidationErrors::default()).is_retryable());
    }

    #[test]
    fn test_client_errors_do_not_trip_circuit() {
        assert!(!DispatchError::from(HandlerError::NotFound("x".into())).counts_toward_circuit());
        assert!(
            !DispatchError::from(HandlerError::BusinessRuleViolation("x".into()))
                .counts_toward_circuit()
        );
        assert!(
            !DispatchError::IdempotencyKeyConflict { key: "k".into() }.counts_toward_circuit()
        );
        assert!(
            DispatchError::from(HandlerError::ExecutionFailed("x".into())).counts_toward_circuit()
        );
    }

    #[test]
    fn test_root_cause_unwraps_exhaustion() {
        let err = DispatchError::RetryExhausted {
            attempts: 3,
            last: Box::new(HandlerError::Transient("db".into()).into()),
        };

        assert!(matches!(
            err.root_cause(),
            DispatchError::Handler(HandlerError::Transient(_))
        ));
        assert_eq!(err.to_string(), "Gave up after 3 attempts: Transient failure: db");
    }
}
