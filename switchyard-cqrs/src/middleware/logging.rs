use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::DispatchResult;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Logs every dispatch with its outcome and duration.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        let message_type = envelope.message_type();
        let kind = envelope.kind();
        let request_id = envelope.context().request_id();
        let correlation_id = envelope.context().correlation_id().map(str::to_owned);
        let start = Instant::now();

        debug!(
            %request_id,
            correlation_id = ?correlation_id,
            message_type,
            kind = %kind,
            "Dispatching message"
        );

        let result = next.run(envelope).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(
                %request_id,
                message_type,
                kind = %kind,
                elapsed_ms,
                "Message handled"
            ),
            Err(error) => warn!(
                %request_id,
                message_type,
                kind = %kind,
                elapsed_ms,
                error = %error,
                "Message failed"
            ),
        }

        result
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
