//! Per-dispatch request context

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use switchyard_events::Event;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ambient data travelling with one dispatch.
///
/// Clones share the cancellation token and the recorded-events buffer. Each
/// handler attempt records into a buffer of its own, which replaces the
/// shared one only if that attempt succeeds and is still the latest.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    request_id: Uuid,
    correlation_id: Option<String>,
    tenant_id: Option<String>,
    metadata: HashMap<String, String>,
    cancellation: CancellationToken,
    events: Arc<Mutex<Vec<Arc<dyn Event>>>>,
    attempts: Arc<AtomicU64>,
}

type EventBuffer = Arc<Mutex<Vec<Arc<dyn Event>>>>;

/// Events recorded by one handler attempt, pending commit.
pub(crate) struct AttemptEvents {
    dispatch: EventBuffer,
    recorder: EventBuffer,
    attempts: Arc<AtomicU64>,
    attempt: u64,
    cancellation: CancellationToken,
}

impl AttemptEvents {
    /// Publish this attempt's events in place of the dispatch's buffer.
    ///
    /// Skipped when a later attempt has started or the attempt was cancelled,
    /// e.g. after a timeout.
    pub(crate) fn commit(self) {
        let mut dispatch = self.dispatch.lock();
        if self.attempts.load(Ordering::SeqCst) != self.attempt || self.cancellation.is_cancelled() {
            return;
        }
        *dispatch = std::mem::take(&mut *self.recorder.lock());
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchContext {
    /// Create a context with a fresh request ID.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            correlation_id: None,
            tenant_id: None,
            metadata: HashMap::new(),
            cancellation: CancellationToken::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set tenant ID
    pub fn with_tenant_id(mut self, id: impl Into<String>) -> Self {
        self.tenant_id = Some(id.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Use `token` for cooperative cancellation.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Token handlers should observe to stop work early.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Record a domain event to publish once the command succeeds.
    pub fn record_event<E: Event>(&self, event: E) {
        self.events.lock().push(Arc::new(event));
    }

    /// Number of events recorded so far.
    pub fn recorded_event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Drain the recorded events.
    pub fn take_events(&self) -> Vec<Arc<dyn Event>> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Give this context a fresh recorder for one handler attempt.
    ///
    /// Events left behind by earlier attempts are dropped.
    pub(crate) fn begin_attempt(&mut self) -> AttemptEvents {
        let dispatch = std::mem::replace(&mut self.events, Arc::new(Mutex::new(Vec::new())));
        let attempt = {
            let mut pending = dispatch.lock();
            pending.clear();
            self.attempts.fetch_add(1, Ordering::SeqCst) + 1
        };
        AttemptEvents {
            dispatch,
            recorder: Arc::clone(&self.events),
            attempts: Arc::clone(&self.attempts),
            attempt,
            cancellation: self.cancellation.clone(),
        }
    }
}
