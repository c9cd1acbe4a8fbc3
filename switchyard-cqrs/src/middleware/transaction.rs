use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult};
use crate::message::MessageKind;
use crate::unit_of_work::UnitOfWork;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Runs each command inside a transaction: commit on success, roll back on
/// failure. Queries pass through untouched.
pub struct TransactionMiddleware {
    unit_of_work: Arc<dyn UnitOfWork>,
}

impl TransactionMiddleware {
    pub fn new(unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        Self { unit_of_work }
    }
}

#[async_trait]
impl Middleware for TransactionMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        if envelope.kind() != MessageKind::Command {
            return next.run(envelope).await;
        }

        let message_type = envelope.message_type();
        let transaction = self
            .unit_of_work
            .begin(envelope.context())
            .await
            .map_err(|e| DispatchError::middleware(self.name(), format!("begin failed: {}", e)))?;

        match next.run(envelope).await {
            Ok(value) => {
                transaction.commit().await.map_err(|e| {
                    DispatchError::middleware(self.name(), format!("commit failed: {}", e))
                })?;
                debug!(message_type, "Transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    error!(
                        message_type,
                        error = %rollback_error,
                        "Transaction rollback failed"
                    );
                } else {
                    debug!(message_type, "Transaction rolled back");
                }
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "transaction"
    }
}
