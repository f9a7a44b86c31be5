//! Metrics collection for governed traffic.
//!
//! Counters, histograms and gauges keyed by name plus optional labels, and a
//! [`MetricsObserver`] translating governance events into metrics.

use crate::errors::ProviderError;
use crate::resilience::{CircuitState, GovernanceObserver};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sink for governor metrics.
pub trait MetricsCollector: Send + Sync {
    /// Increments a counter by the given value.
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Records a value in a histogram.
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Sets a gauge to the given value.
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Summary statistics of a histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    /// Recorded values
    pub count: usize,
    /// Sum of values
    pub sum: f64,
    /// Smallest value
    pub min: f64,
    /// Largest value
    pub max: f64,
}

impl HistogramSummary {
    /// Arithmetic mean
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// In-memory metrics collector for testing and simple deployments.
///
/// Labeled series are stored under `name:key=value,...`.
#[derive(Default)]
pub struct InMemoryMetricsCollector {
    counters: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemoryMetricsCollector {
    /// Creates a new in-memory metrics collector.
    ///
    /// ```
    /// use integrations_inference_governor::observability::{InMemoryMetricsCollector, MetricsCollector};
    ///
    /// let collector = InMemoryMetricsCollector::new();
    /// collector.increment_counter("governor.requests.total", 1, &[("resource", "haiku")]);
    /// assert_eq!(collector.get_counter("governor.requests.total:resource=haiku"), 1);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never incremented
    pub fn get_counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of a counter over all label sets
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{}:", name);
        self.counters
            .read()
            .iter()
            .filter(|(key, _)| key.as_str() == name || key.starts_with(&prefix))
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// All values recorded in a histogram
    pub fn get_histogram(&self, name: &str) -> Vec<f64> {
        self.histograms
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Count, sum and range of a histogram, `None` if empty
    pub fn histogram_summary(&self, name: &str) -> Option<HistogramSummary> {
        let histograms = self.histograms.read();
        let values = histograms.get(name).filter(|v| !v.is_empty())?;
        Some(HistogramSummary {
            count: values.len(),
            sum: values.iter().sum(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    /// Current value of a gauge
    pub fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(name).copied()
    }

    /// Clears every series
    pub fn reset(&self) {
        self.counters.write().clear();
        self.histograms.write().clear();
        self.gauges.write().clear();
    }

    fn make_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            name.to_string()
        } else {
            let label_str: Vec<String> = labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{}:{}", name, label_str.join(","))
        }
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        self.histograms.write().entry(key).or_default().push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = Self::make_key(name, labels);
        self.gauges.write().insert(key, value);
    }
}

impl std::fmt::Debug for InMemoryMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetricsCollector")
            .field("counters", &self.counters.read().len())
            .field("histograms", &self.histograms.read().len())
            .field("gauges", &self.gauges.read().len())
            .finish()
    }
}

/// Collector that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn increment_counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Standard metric names emitted by the governor.
pub mod metric_names {
    /// Requests submitted to the orchestrator
    pub const REQUEST_COUNT: &str = "governor.requests.total";

    /// Requests that ended in an error
    pub const REQUEST_ERRORS: &str = "governor.requests.errors";

    /// Submission-to-completion time in milliseconds
    pub const REQUEST_DURATION_MS: &str = "governor.requests.duration_ms";

    /// Token units charged to the rate governor
    pub const TOKENS_CONSUMED: &str = "governor.tokens.consumed";

    /// Requests that had to wait for quota
    pub const RATE_LIMIT_QUEUED: &str = "governor.rate_limit.queued";

    /// Retry attempts scheduled
    pub const RETRY_ATTEMPTS: &str = "governor.retry.attempts";

    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub const CIRCUIT_BREAKER_STATE: &str = "governor.circuit_breaker.state";

    /// Provider calls currently in flight
    pub const ACTIVE_REQUESTS: &str = "governor.requests.active";
}

/// Observer recording governance events as metrics
#[derive(Clone)]
pub struct MetricsObserver {
    metrics: Arc<dyn MetricsCollector>,
}

impl MetricsObserver {
    /// Forward events into `metrics`
    pub fn new(metrics: Arc<dyn MetricsCollector>) -> Self {
        Self { metrics }
    }
}

impl GovernanceObserver for MetricsObserver {
    fn on_request_queued(&self, resource: &str, _queue_length: usize) {
        self.metrics.increment_counter(
            metric_names::RATE_LIMIT_QUEUED,
            1,
            &[("resource", resource)],
        );
    }

    fn on_limit_consumed(&self, resource: &str, units: u64) {
        self.metrics.increment_counter(
            metric_names::TOKENS_CONSUMED,
            units,
            &[("resource", resource)],
        );
    }

    fn on_retry_attempt(
        &self,
        operation: &str,
        _attempt: u32,
        _delay: Duration,
        error: &ProviderError,
    ) {
        self.metrics.increment_counter(
            metric_names::RETRY_ATTEMPTS,
            1,
            &[("operation", operation), ("error", error.name.as_str())],
        );
    }

    fn on_circuit_state_change(&self, _from: CircuitState, to: CircuitState, _failures: u32) {
        self.metrics
            .set_gauge(metric_names::CIRCUIT_BREAKER_STATE, to.as_gauge(), &[]);
    }

    fn on_circuit_reset(&self) {
        self.metrics.set_gauge(
            metric_names::CIRCUIT_BREAKER_STATE,
            CircuitState::Closed.as_gauge(),
            &[],
        );
    }
}

impl std::fmt::Debug for MetricsObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsObserver").finish_non_exhaustive()
    }
}
