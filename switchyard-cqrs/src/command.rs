//! Commands and the command bus

use crate::context::DispatchContext;
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult, HandlerError};
use crate::message::Command;
use crate::middleware::{CacheInvalidationMiddleware, FrozenChain, Middleware, MiddlewareChain};
use crate::registry::{DynHandler, HandlerRegistry, mismatched, terminal};
use async_trait::async_trait;
use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;
use switchyard_cache::JitteredCache;
use switchyard_events::EventBus;
use tracing::{debug, info, warn};

/// Command handler trait
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    /// Handle the command
    ///
    /// Domain events recorded on `ctx` are published after the command
    /// succeeds.
    async fn handle(&self, command: C, ctx: &DispatchContext) -> Result<C::Result, HandlerError>;
}

/// Wrapper for typed command handlers
struct TypedCommandHandler<C, H> {
    handler: H,
    _phantom: PhantomData<fn(C)>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C> + 'static> DynHandler for TypedCommandHandler<C, H> {
    async fn handle_dyn(&self, envelope: Envelope) -> DispatchResult {
        let command = envelope
            .message::<C>()
            .cloned()
            .ok_or_else(|| mismatched(C::message_name(), &envelope))?;
        let result = self.handler.handle(command, envelope.context()).await?;
        Ok(serde_json::to_value(result)?)
    }
}

struct CommandBusInner {
    handlers: HandlerRegistry,
    chain: FrozenChain,
    event_bus: Option<EventBus>,
}

/// Command bus for dispatching commands to handlers
///
/// Cloning is cheap; clones share handlers and middleware.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<CommandBusInner>,
}

impl CommandBus {
    /// Create a command bus without middleware or event publishing.
    pub fn new() -> Self {
        CommandBusBuilder::new().build()
    }

    /// Start configuring a command bus.
    pub fn builder() -> CommandBusBuilder {
        CommandBusBuilder::new()
    }

    /// Register a command handler
    pub fn register<C, H>(&self, handler: H) -> Result<(), DispatchError>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let wrapper = TypedCommandHandler {
            handler,
            _phantom: PhantomData,
        };
        self.inner
            .handlers
            .register(TypeId::of::<C>(), C::message_name(), Arc::new(wrapper))?;
        info!(command_type = C::message_name(), "Registered command handler");
        Ok(())
    }

    /// Remove the handler for `C`. Returns whether one was registered.
    pub fn unregister<C: Command>(&self) -> bool {
        self.inner.handlers.unregister(TypeId::of::<C>())
    }

    pub fn has_handler<C: Command>(&self) -> bool {
        self.inner.handlers.contains(TypeId::of::<C>())
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// Names of commands with a registered handler, sorted.
    pub fn registered_commands(&self) -> Vec<&'static str> {
        self.inner.handlers.message_types()
    }

    /// Middleware names, outermost first.
    pub fn middleware(&self) -> Vec<&'static str> {
        self.inner.chain.names()
    }

    /// Dispatch a command with a fresh context
    pub async fn dispatch<C: Command>(&self, command: C) -> Result<C::Result, DispatchError> {
        self.dispatch_with(command, DispatchContext::new()).await
    }

    /// Dispatch a command within `ctx`
    pub async fn dispatch_with<C: Command>(
        &self,
        command: C,
        ctx: DispatchContext,
    ) -> Result<C::Result, DispatchError> {
        let command_type = C::message_name();
        let handler = self
            .inner
            .handlers
            .get(TypeId::of::<C>())
            .ok_or_else(|| DispatchError::HandlerNotFound {
                message_type: command_type.to_string(),
            })?;

        debug!(command_type, request_id = %ctx.request_id(), "Dispatching command");

        let envelope = Envelope::for_command(command, ctx.clone())?;
        let outcome = self
            .inner
            .chain
            .execute(envelope, terminal(handler))
            .await
            .and_then(|value| Ok(serde_json::from_value::<C::Result>(value)?));

        match outcome {
            Ok(result) => {
                self.publish_recorded(command_type, &ctx).await;
                Ok(result)
            }
            Err(e) => {
                let discarded = ctx.take_events().len();
                if discarded > 0 {
                    debug!(command_type, discarded, "Discarding events of failed command");
                }
                Err(e)
            }
        }
    }

    async fn publish_recorded(&self, command_type: &str, ctx: &DispatchContext) {
        let events = ctx.take_events();
        if events.is_empty() {
            return;
        }
        let Some(event_bus) = &self.inner.event_bus else {
            debug!(
                command_type,
                count = events.len(),
                "No event bus configured, discarding recorded events"
            );
            return;
        };
        for event in events {
            let event_name = event.event_name().to_string();
            if let Err(e) = event_bus.publish_dyn(event).await {
                warn!(
                    command_type,
                    event = %event_name,
                    failed_handlers = ?e.handler_names(),
                    error = %e,
                    "Event publication failed after command succeeded"
                );
            }
        }
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("handlers", &self.inner.handlers.message_types())
            .field("middleware", &self.inner.chain.names())
            .field("event_bus", &self.inner.event_bus.is_some())
            .finish()
    }
}

/// Builder for command buses
#[derive(Default)]
pub struct CommandBusBuilder {
    chain: MiddlewareChain,
    event_bus: Option<EventBus>,
    invalidation: Option<JitteredCache>,
}

impl CommandBusBuilder {
    /// Create a builder with an empty middleware chain and no event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. The first added is the outermost.
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.chain.push(Arc::new(middleware));
        self
    }

    /// Append a shared middleware.
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.chain.push(middleware);
        self
    }

    /// Publish recorded domain events through `event_bus`.
    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Invalidate query cache tags named by successful commands.
    pub fn invalidate_cache(mut self, cache: JitteredCache) -> Self {
        self.invalidation = Some(cache);
        self
    }

    /// Freeze the middleware chain and create the bus.
    pub fn build(self) -> CommandBus {
        let mut chain = self.chain;
        if let Some(cache) = self.invalidation {
            chain.push(Arc::new(CacheInvalidationMiddleware::new(cache)));
        }
        CommandBus {
            inner: Arc::new(CommandBusInner {
                handlers: HandlerRegistry::default(),
                chain: chain.freeze(),
                event_bus: self.event_bus,
            }),
        }
    }
}
