use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use tracing::debug;

/// Rejects messages whose own validation fails before they reach the handler.
#[derive(Debug, Clone, Default)]
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        if let Err(errors) = envelope.validate() {
            debug!(
                message_type = envelope.message_type(),
                error_count = errors.len(),
                "Message failed validation"
            );
            return Err(DispatchError::Validation(errors));
        }
        next.run(envelope).await
    }

    fn name(&self) -> &'static str {
        "validation"
    }
}
