//! Handler registry shared by the command and query buses

use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult};
use crate::middleware::Terminal;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::TypeId;
use std::sync::Arc;

/// Type-erased handler invoked at the end of the chain.
#[async_trait]
pub(crate) trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, envelope: Envelope) -> DispatchResult;
}

struct Registration {
    message_type: &'static str,
    handler: Arc<dyn DynHandler>,
}

/// One handler per message type.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: DashMap<TypeId, Registration>,
}

impl HandlerRegistry {
    pub(crate) fn register(
        &self,
        type_id: TypeId,
        message_type: &'static str,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), DispatchError> {
        match self.handlers.entry(type_id) {
            Entry::Occupied(_) => Err(DispatchError::HandlerAlreadyRegistered {
                message_type: message_type.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    message_type,
                    handler,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn unregister(&self, type_id: TypeId) -> bool {
        self.handlers.remove(&type_id).is_some()
    }

    /// The handler for `type_id`. The registry guard is released on return.
    pub(crate) fn get(&self, type_id: TypeId) -> Option<Arc<dyn DynHandler>> {
        self.handlers
            .get(&type_id)
            .map(|registration| Arc::clone(&registration.handler))
    }

    pub(crate) fn contains(&self, type_id: TypeId) -> bool {
        self.handlers.contains_key(&type_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn message_types(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.handlers.iter().map(|r| r.value().message_type).collect();
        names.sort_unstable();
        names
    }
}

/// Terminal step invoking `handler` with a recorder of its own. Recorded
/// events reach the dispatch only if the attempt succeeds.
pub(crate) fn terminal(handler: Arc<dyn DynHandler>) -> Terminal {
    Arc::new(move |mut envelope: Envelope| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let attempt = envelope.context_mut().begin_attempt();
            let result = handler.handle_dyn(envelope).await;
            if result.is_ok() {
                attempt.commit();
            }
            result
        })
    })
}

/// Error for an envelope that does not carry the handler's message type.
pub(crate) fn mismatched(expected: &'static str, envelope: &Envelope) -> DispatchError {
    DispatchError::middleware(
        "dispatch",
        format!(
            "handler for {} received {}",
            expected,
            envelope.message_type()
        ),
    )
}
