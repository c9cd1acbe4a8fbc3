use super::{Middleware, Next};
use crate::envelope::Envelope;
use crate::error::{DispatchError, DispatchResult};
use crate::message::MessageKind;
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::Instant;

/// Total dispatches labelled by kind, message type and outcome.
pub const DISPATCH_TOTAL: &str = "switchyard_dispatch_total";
/// Dispatch latency in seconds.
pub const DISPATCH_DURATION: &str = "switchyard_dispatch_duration_seconds";
/// Dispatches currently executing, by kind.
pub const DISPATCH_IN_FLIGHT: &str = "switchyard_dispatch_in_flight";

/// Records count, latency and concurrency of dispatches.
pub struct MetricsMiddleware {
    sink: Arc<dyn MetricsSink>,
    in_flight_commands: AtomicI64,
    in_flight_queries: AtomicI64,
}

impl MetricsMiddleware {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            in_flight_commands: AtomicI64::new(0),
            in_flight_queries: AtomicI64::new(0),
        }
    }

    fn gauge(&self, kind: MessageKind) -> &AtomicI64 {
        match kind {
            MessageKind::Command => &self.in_flight_commands,
            MessageKind::Query => &self.in_flight_queries,
        }
    }

    fn adjust_in_flight(&self, kind: MessageKind, delta: i64) {
        let value = self.gauge(kind).fetch_add(delta, Ordering::SeqCst) + delta;
        self.sink
            .set_gauge(DISPATCH_IN_FLIGHT, value as f64, &[("kind", kind.as_str())]);
    }
}

/// Outcome label for a dispatch result.
fn outcome(result: &DispatchResult) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(error) => match error.root_cause() {
            DispatchError::Validation(_) => "invalid",
            DispatchError::CircuitOpen { .. } | DispatchError::BulkheadRejected { .. } => {
                "rejected"
            }
            DispatchError::Timeout { .. } => "timeout",
            _ => "error",
        },
    }
}

struct InFlight<'a> {
    middleware: &'a MetricsMiddleware,
    kind: MessageKind,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.middleware.adjust_in_flight(self.kind, -1);
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> DispatchResult {
        let kind = envelope.kind();
        let message_type = envelope.message_type();
        let start = Instant::now();

        self.adjust_in_flight(kind, 1);
        let guard = InFlight {
            middleware: self,
            kind,
        };
        let result = next.run(envelope).await;
        drop(guard);

        let labels = [
            ("kind", kind.as_str()),
            ("message_type", message_type),
            ("outcome", outcome(&result)),
        ];
        self.sink.increment_counter(DISPATCH_TOTAL, &labels);
        self.sink.observe_histogram(
            DISPATCH_DURATION,
            start.elapsed().as_secs_f64(),
            &labels[..2],
        );

        result
    }

    fn name(&self) -> &'static str {
        "metrics"
    }
}
