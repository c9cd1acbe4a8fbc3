//! Metrics sinks for the dispatch pipeline
//!
//! [`MetricsSink`] is the narrow recording interface the metrics middleware
//! writes to. [`PrometheusMetrics`] registers label vectors lazily on first
//! use and exports the text exposition format.

use dashmap::DashMap;
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tracing::warn;

/// Default buckets for latency histograms (in seconds)
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Metrics recording interface
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}

    fn observe_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}

    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Prometheus-backed sink.
///
/// A metric's label names are fixed by its first recording. Later recordings
/// with different label names are dropped with a warning.
pub struct PrometheusMetrics {
    registry: Registry,
    counters: DashMap<String, CounterVec>,
    histograms: DashMap<String, HistogramVec>,
    gauges: DashMap<String, GaugeVec>,
    buckets: Vec<f64>,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    /// Sink with its own registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Sink registering into an existing registry.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            counters: DashMap::new(),
            histograms: DashMap::new(),
            gauges: DashMap::new(),
            buckets: DEFAULT_LATENCY_BUCKETS.to_vec(),
        }
    }

    /// Histogram buckets for metrics registered after this call.
    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn register<C>(&self, collector: C) -> Result<C, prometheus::Error>
    where
        C: prometheus::core::Collector + Clone + 'static,
    {
        self.registry.register(Box::new(collector.clone()))?;
        Ok(collector)
    }
}

fn split(labels: &[(&str, &str)]) -> (Vec<String>, Vec<String>) {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .unzip()
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

impl MetricsSink for PrometheusMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let (names, values) = split(labels);
        let vec = self
            .counters
            .entry(name.to_string())
            .or_try_insert_with(|| {
                self.register(CounterVec::new(Opts::new(name, name), as_strs(&names).as_slice())?)
            });
        match vec {
            Ok(vec) => match vec.get_metric_with_label_values(as_strs(&values).as_slice()) {
                Ok(counter) => counter.inc(),
                Err(e) => warn!(metric = name, error = %e, "Dropping counter sample"),
            },
            Err(e) => warn!(metric = name, error = %e, "Failed to register counter"),
        }
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let (names, values) = split(labels);
        let vec = self
            .histograms
            .entry(name.to_string())
            .or_try_insert_with(|| {
                let opts = HistogramOpts::new(name, name).buckets(self.buckets.clone());
                self.register(HistogramVec::new(opts, as_strs(&names).as_slice())?)
            });
        match vec {
            Ok(vec) => match vec.get_metric_with_label_values(as_strs(&values).as_slice()) {
                Ok(histogram) => histogram.observe(value),
                Err(e) => warn!(metric = name, error = %e, "Dropping histogram sample"),
            },
            Err(e) => warn!(metric = name, error = %e, "Failed to register histogram"),
        }
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let (names, values) = split(labels);
        let vec = self
            .gauges
            .entry(name.to_string())
            .or_try_insert_with(|| {
                self.register(GaugeVec::new(Opts::new(name, name), as_strs(&names).as_slice())?)
            });
        match vec {
            Ok(vec) => match vec.get_metric_with_label_values(as_strs(&values).as_slice()) {
                Ok(gauge) => gauge.set(value),
                Err(e) => warn!(metric = name, error = %e, "Dropping gauge sample"),
            },
            Err(e) => warn!(metric = name, error = %e, "Failed to register gauge"),
        }
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("counters", &self.counters.len())
            .field("histograms", &self.histograms.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_exported() {
        let metrics = PrometheusMetrics::new();

        metrics.increment_counter("orders_total", &[("outcome", "success")]);
        metrics.increment_counter("orders_total", &[("outcome", "success")]);
        metrics.observe_histogram("orders_seconds", 0.02, &[("outcome", "success")]);
        metrics.set_gauge("orders_in_flight", 3.0, &[]);

        let text = metrics.export().unwrap();
        assert!(text.contains(r#"orders_total{outcome="success"} 2"#));
        assert!(text.contains("orders_seconds_bucket"));
        assert!(text.contains("orders_in_flight 3"));
    }

    #[test]
    fn test_mismatched_labels_are_dropped() {
        let metrics = PrometheusMetrics::new();

        metrics.increment_counter("jobs_total", &[("queue", "a")]);
        metrics.increment_counter("jobs_total", &[("queue", "a"), ("extra", "b")]);

        let text = metrics.export().unwrap();
        assert!(text.contains(r#"jobs_total{queue="a"} 1"#));
    }
}
