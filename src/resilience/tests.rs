//! Tests exercising the governance components together through the orchestrator

use super::*;
use crate::errors::{ErrorKind, GovernorError, ProviderError};
use crate::fixtures::{self, TEST_RESOURCE};
use crate::ledger::EntryStatus;
use crate::mocks::ScriptedProvider;
use crate::observability::{metric_names, InMemoryMetricsCollector};
use crate::provider::InferenceProvider;
use crate::types::{InferenceRequest, Usage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready_ok, task};

/// One request per minute, ample tokens
fn single_request_quota() -> ResourceQuotaConfig {
    ResourceQuotaConfig::new(1, 100, 10_000, 100_000)
}

fn build(provider: Arc<dyn InferenceProvider>, quota: ResourceQuotaConfig) -> RequestOrchestrator {
    RequestOrchestrator::builder()
        .config(fixtures::config_with_quota(quota))
        .provider(provider)
        .build()
        .unwrap()
}

fn request(payload: &str) -> InferenceRequest {
    InferenceRequest::new(fixtures::TEST_PROFILE, payload).with_cost_override(10)
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl GovernanceObserver for RecordingObserver {
    fn on_request_queued(&self, resource: &str, queue_length: usize) {
        self.events
            .lock()
            .push(format!("queued {} {}", resource, queue_length));
    }

    fn on_request_dequeued(&self, resource: &str, remaining: usize) {
        self.events
            .lock()
            .push(format!("dequeued {} {}", resource, remaining));
    }

    fn on_limit_consumed(&self, resource: &str, units: u64) {
        self.events
            .lock()
            .push(format!("consumed {} {}", resource, units));
    }

    fn on_circuit_state_change(&self, from: CircuitState, to: CircuitState, _failures: u32) {
        self.events.lock().push(format!("circuit {} -> {}", from, to));
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_requests_are_served_in_arrival_order() {
    let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_secs(1)));
    let orchestrator = build(provider.clone(), single_request_quota());
    let started = Instant::now();

    orchestrator.process(request("first")).await.unwrap();

    let (second, third) = tokio::join!(
        orchestrator.process(request("second")),
        orchestrator.process(request("third")),
    );
    second.unwrap();
    third.unwrap();

    let payloads: Vec<String> = provider.calls().into_iter().map(|c| c.payload).collect();
    assert_eq!(payloads, ["first", "second", "third"]);
    // one request per minute refill
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(orchestrator.queue_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_arrivals_cannot_overdraw_an_exhausted_resource() {
    let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_secs(5)));
    let orchestrator = build(
        provider.clone(),
        ResourceQuotaConfig::new(2, 100, 10_000, 100_000),
    );
    let started = Instant::now();

    let (a, b, c) = tokio::join!(
        orchestrator.process(request("a")),
        orchestrator.process(request("b")),
        orchestrator.process(request("c")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    // the third call waits for a request to refill at 30s
    assert_eq!(provider.peak_in_flight(), 2);
    assert!(started.elapsed() >= Duration::from_secs(35));
    assert_eq!(orchestrator.ledger_summary().succeeded, 3);
    assert_eq!(
        orchestrator
            .usage_stats(TEST_RESOURCE, UsageWindow::Minute)
            .unwrap()
            .requests,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweeps_during_running_calls_release_one_waiter_per_refill() {
    let provider = Arc::new(ScriptedProvider::new().with_latency(Duration::from_secs(90)));
    let orchestrator = RequestOrchestrator::builder()
        .config(fixtures::config_with_quota(single_request_quota()))
        .provider(provider.clone())
        .without_sweeper()
        .build()
        .unwrap();

    let mut batch = task::spawn(futures::future::join_all(
        ["first", "second", "third"].map(|payload| orchestrator.process(request(payload))),
    ));
    assert_pending!(batch.poll());
    assert_eq!(provider.call_count(), 1);
    assert_eq!(orchestrator.queue_size(), 2);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(orchestrator.rate_governor().sweep(), 1);
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.rate_governor().sweep(), 0);

    assert_pending!(batch.poll());
    assert_eq!(provider.call_count(), 2);
    assert_eq!(orchestrator.active_requests(), 2);
    assert_eq!(orchestrator.queue_size(), 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(orchestrator.rate_governor().sweep(), 1);
    assert_pending!(batch.poll());
    assert_eq!(provider.call_count(), 3);
    assert_eq!(orchestrator.queue_size(), 0);

    tokio::time::advance(Duration::from_secs(91)).await;
    let results = match batch.poll() {
        std::task::Poll::Ready(results) => results,
        std::task::Poll::Pending => panic!("batch still pending"),
    };
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(provider.peak_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_a_queued_request_abandons_it() {
    let orchestrator = RequestOrchestrator::builder()
        .config(fixtures::config_with_quota(single_request_quota()))
        .provider(Arc::new(ScriptedProvider::new()))
        .without_sweeper()
        .build()
        .unwrap();

    orchestrator.process(request("first")).await.unwrap();

    let mut waiting = task::spawn(orchestrator.process(request("second")));
    assert_pending!(waiting.poll());
    assert_eq!(orchestrator.queue_size(), 1);
    assert_eq!(orchestrator.ledger_summary().in_flight, 1);

    drop(waiting);

    assert_eq!(orchestrator.queue_size(), 0);
    let summary = orchestrator.ledger_summary();
    assert_eq!(summary.in_flight, 0);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(orchestrator.recent_requests(1)[0].status, EntryStatus::Abandoned);

    // the abandoned entry no longer blocks later arrivals
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(orchestrator.rate_governor().sweep(), 0);
    orchestrator.process(request("third")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_manual_sweep_releases_waiter_and_notifies_observers() {
    let observer = Arc::new(RecordingObserver::default());
    let orchestrator = RequestOrchestrator::builder()
        .config(fixtures::config_with_quota(single_request_quota()))
        .provider(Arc::new(
            ScriptedProvider::new().always_usage(Usage::new(3, 4)),
        ))
        .observer(observer.clone())
        .without_sweeper()
        .build()
        .unwrap();

    orchestrator.process(request("first")).await.unwrap();

    let mut waiting = task::spawn(orchestrator.process(request("second")));
    assert_pending!(waiting.poll());

    // nothing fits before the request bucket refills
    assert_eq!(orchestrator.rate_governor().sweep(), 0);
    assert_pending!(waiting.poll());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(orchestrator.rate_governor().sweep(), 1);
    assert!(waiting.is_woken());
    let response = assert_ready_ok!(waiting.poll());
    assert_eq!(response.cost_actually_charged, 7);

    assert_eq!(
        observer.events(),
        [
            format!("consumed {} 7", TEST_RESOURCE),
            format!("queued {} 1", TEST_RESOURCE),
            format!("dequeued {} 0", TEST_RESOURCE),
            format!("consumed {} 7", TEST_RESOURCE),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_raising_concurrency_limit_shortens_the_batch() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_latency(Duration::from_millis(100))
            .always_usage(Usage::new(1, 1)),
    );
    let orchestrator = build(provider.clone(), fixtures::roomy_quota());

    orchestrator.set_concurrency_limit(1);
    let started = Instant::now();
    let batch = (0..4).map(|i| orchestrator.process(request(&format!("serial {}", i))));
    for result in futures::future::join_all(batch).await {
        result.unwrap();
    }
    let serial = started.elapsed();
    assert_eq!(provider.peak_in_flight(), 1);
    assert!(serial >= Duration::from_millis(400));

    orchestrator.set_concurrency_limit(4);
    let started = Instant::now();
    let batch = (0..4).map(|i| orchestrator.process(request(&format!("parallel {}", i))));
    for result in futures::future::join_all(batch).await {
        result.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(provider.peak_in_flight(), 4);
    assert_eq!(orchestrator.total_units_processed(), 16);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_recovers_through_half_open() {
    let observer = Arc::new(RecordingObserver::default());
    let provider = Arc::new(
        ScriptedProvider::new()
            .then_fail(ProviderError::authentication("expired"))
            .then_fail(ProviderError::authentication("expired"))
            .then_fail(ProviderError::authentication("expired")),
    );
    let orchestrator = RequestOrchestrator::builder()
        .config(fixtures::test_config())
        .provider(provider.clone())
        .observer(observer.clone())
        .build()
        .unwrap();

    for _ in 0..3 {
        let err = orchestrator.process(request("auth")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Terminal);
    }
    assert_eq!(orchestrator.circuit_status().state, CircuitState::Open);

    let err = orchestrator.process(request("rejected")).await.unwrap_err();
    assert!(matches!(err, GovernorError::CircuitOpen { .. }));
    assert!(err.retry_after().unwrap() <= Duration::from_secs(1));
    assert_eq!(provider.call_count(), 3);

    tokio::time::advance(Duration::from_secs(1)).await;

    // default success threshold of three trial calls
    for _ in 0..3 {
        orchestrator.process(request("trial")).await.unwrap();
    }
    assert_eq!(orchestrator.circuit_status().state, CircuitState::Closed);

    let transitions: Vec<String> = observer
        .events()
        .into_iter()
        .filter(|e| e.starts_with("circuit"))
        .collect();
    assert_eq!(
        transitions,
        [
            "circuit closed -> open",
            "circuit open -> half-open",
            "circuit half-open -> closed",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_count_as_one_breaker_failure() {
    let provider = Arc::new(ScriptedProvider::new().always_fail(ProviderError::overloaded("busy")));
    let metrics = Arc::new(InMemoryMetricsCollector::new());
    let orchestrator = RequestOrchestrator::builder()
        .config(fixtures::test_config())
        .provider(provider.clone())
        .metrics(metrics.clone())
        .build()
        .unwrap();

    let err = orchestrator.process(request("busy")).await.unwrap_err();

    assert!(matches!(err, GovernorError::RetriesExhausted { attempts: 4, .. }));
    assert!(err.is_retryable());
    assert_eq!(provider.call_count(), 4);
    assert_eq!(orchestrator.circuit_status().consecutive_failures, 1);
    assert_eq!(orchestrator.total_units_processed(), 0);
    assert_eq!(
        metrics.get_counter(&format!(
            "{}:resource={},kind=retries_exhausted",
            metric_names::REQUEST_ERRORS,
            TEST_RESOURCE
        )),
        1
    );
    assert_eq!(
        metrics.counter_total(metric_names::RETRY_ATTEMPTS),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_successful_request_metrics() {
    let metrics = Arc::new(InMemoryMetricsCollector::new());
    let orchestrator = RequestOrchestrator::builder()
        .config(fixtures::test_config())
        .provider(Arc::new(
            ScriptedProvider::new().always_usage(Usage::new(20, 30)),
        ))
        .metrics(metrics.clone())
        .build()
        .unwrap();

    orchestrator.process(request("measured")).await.unwrap();

    let resource_key = |name: &str| format!("{}:resource={}", name, TEST_RESOURCE);
    assert_eq!(metrics.get_counter(&resource_key(metric_names::REQUEST_COUNT)), 1);
    assert_eq!(metrics.get_counter(&resource_key(metric_names::TOKENS_CONSUMED)), 50);
    assert_eq!(
        metrics.get_histogram(&resource_key(metric_names::REQUEST_DURATION_MS)).len(),
        1
    );
    assert_eq!(metrics.get_gauge(metric_names::ACTIVE_REQUESTS), Some(0.0));

    let status = orchestrator.resource_status(TEST_RESOURCE).unwrap();
    assert_eq!(status.requests_remaining.per_minute, 999);
    assert!(!status.is_limited);
    assert!(orchestrator.rate_limit_status().contains_key(TEST_RESOURCE));
}
