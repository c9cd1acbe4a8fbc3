//! Type-erased message envelope carried through the middleware chain

use crate::context::DispatchContext;
use crate::error::DispatchError;
use crate::idempotency::compute_request_hash;
use crate::message::{Command, Message, MessageKind, Query};
use crate::validation::ValidationErrors;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::sync::Arc;
use std::time::Duration;

/// Typed message behind an envelope.
pub(crate) trait MessageBody: Send + Sync {
    fn validate(&self) -> Result<(), ValidationErrors>;
    fn as_any(&self) -> &dyn Any;
}

impl<M: Message> MessageBody for M {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Message::validate(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// How a query result is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Duration,
    pub tags: Vec<String>,
}

/// A message in flight, together with everything middlewares need to know
/// about it without knowing its concrete type.
#[derive(Clone)]
pub struct Envelope {
    kind: MessageKind,
    message_type: &'static str,
    type_id: TypeId,
    payload: Arc<Value>,
    idempotency_key: Option<String>,
    cache_policy: Option<CachePolicy>,
    invalidates: Vec<String>,
    context: DispatchContext,
    body: Arc<dyn MessageBody>,
}

impl Envelope {
    /// Wrap a command.
    pub fn for_command<C: Command>(command: C, context: DispatchContext) -> Result<Self, DispatchError> {
        let payload = serde_json::to_value(&command)?;
        Ok(Self {
            kind: MessageKind::Command,
            message_type: C::message_name(),
            type_id: TypeId::of::<C>(),
            payload: Arc::new(payload),
            idempotency_key: command.idempotency_key(),
            cache_policy: None,
            invalidates: command.invalidates(),
            context,
            body: Arc::new(command),
        })
    }

    /// Wrap a query.
    ///
    /// Without an explicit key the cache key is
    /// `query:<message name>:<request hash>`, and every cached result is
    /// tagged with the message name.
    pub fn for_query<Q: Query>(query: Q, context: DispatchContext) -> Result<Self, DispatchError> {
        let payload = serde_json::to_value(&query)?;
        let name = Q::message_name();
        let cache_policy = query.cache_ttl().map(|ttl| CachePolicy {
            key: query
                .cache_key()
                .unwrap_or_else(|| format!("query:{}:{}", name, compute_request_hash(name, &payload))),
            ttl,
            tags: vec![name.to_string()],
        });
        Ok(Self {
            kind: MessageKind::Query,
            message_type: name,
            type_id: TypeId::of::<Q>(),
            payload: Arc::new(payload),
            idempotency_key: None,
            cache_policy,
            invalidates: Vec::new(),
            context,
            body: Arc::new(query),
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn message_type_id(&self) -> TypeId {
        self.type_id
    }

    /// Serialized message.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache_policy.as_ref()
    }

    /// Tags to invalidate after a successful command.
    pub fn invalidates(&self) -> &[String] {
        &self.invalidates
    }

    pub fn context(&self) -> &DispatchContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DispatchContext {
        &mut self.context
    }

    /// Run the message's own validation.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        self.body.validate()
    }

    /// Whether the envelope carries an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Borrow the typed message.
    pub fn message<M: Message>(&self) -> Option<&M> {
        self.body.as_any().downcast_ref::<M>()
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("message_type", &self.message_type)
            .field("request_id", &self.context.request_id())
            .field("idempotency_key", &self.idempotency_key)
            .field("cache_policy", &self.cache_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GetProduct {
        sku: String,
    }

    impl Message for GetProduct {
        type Result = u32;

        fn validate(&self) -> Result<(), ValidationErrors> {
            if self.sku.is_empty() {
                return Err(ValidationError::new("sku", "required").into());
            }
            Ok(())
        }
    }

    impl Query for GetProduct {
        fn cache_ttl(&self) -> Option<Duration> {
            Some(Duration::from_secs(60))
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Restock {
        sku: String,
    }

    impl Message for Restock {
        type Result = ();
    }

    impl Command for Restock {
        fn idempotency_key(&self) -> Option<String> {
            Some(format!("restock-{}", self.sku))
        }

        fn invalidates(&self) -> Vec<String> {
            vec![GetProduct::message_name().to_string()]
        }
    }

    #[test]
    fn test_query_cache_key_is_derived_from_payload() {
        let a = Envelope::for_query(GetProduct { sku: "a".into() }, DispatchContext::new()).unwrap();
        let a2 = Envelope::for_query(GetProduct { sku: "a".into() }, DispatchContext::new()).unwrap();
        let b = Envelope::for_query(GetProduct { sku: "b".into() }, DispatchContext::new()).unwrap();

        let policy = a.cache_policy().unwrap();
        assert!(policy.key.starts_with("query:GetProduct:"));
        assert_eq!(policy.tags, vec!["GetProduct".to_string()]);
        assert_eq!(policy.key, a2.cache_policy().unwrap().key);
        assert_ne!(policy.key, b.cache_policy().unwrap().key);
    }

    #[test]
    fn test_command_envelope_carries_command_metadata() {
        let envelope = Envelope::for_command(Restock { sku: "a".into() }, DispatchContext::new()).unwrap();

        assert_eq!(envelope.kind(), MessageKind::Command);
        assert_eq!(envelope.idempotency_key(), Some("restock-a"));
        assert_eq!(envelope.invalidates(), ["GetProduct".to_string()]);
        assert!(envelope.cache_policy().is_none());
        assert!(envelope.is::<Restock>());
        assert_eq!(envelope.message::<Restock>().unwrap().sku, "a");
    }

    #[test]
    fn test_envelope_runs_message_validation() {
        let envelope = Envelope::for_query(GetProduct { sku: String::new() }, DispatchContext::new()).unwrap();

        let errors = envelope.validate().unwrap_err();
        assert_eq!(errors.get_field_errors("sku").len(), 1);
    }
}
