//! Tests wiring the metrics observer into live governance components.

use super::*;
use crate::errors::ProviderError;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, RateGovernor, RateGovernorConfig, ResourceQuotaConfig,
    RetryConfig, RetryExecutor, RetryOutcome,
};
use std::sync::Arc;
use std::time::Duration;

fn observed() -> (Arc<InMemoryMetricsCollector>, Arc<MetricsObserver>) {
    let metrics = Arc::new(InMemoryMetricsCollector::new());
    let observer = Arc::new(MetricsObserver::new(metrics.clone()));
    (metrics, observer)
}

#[test]
fn test_rate_governor_events_become_metrics() {
    let (metrics, observer) = observed();
    let governor = RateGovernor::new(
        RateGovernorConfig::empty().resource("local", ResourceQuotaConfig::new(1, 10, 1000, 10_000)),
    )
    .with_observer(observer);

    governor.consume_limit("local", 400).unwrap();
    let _ticket = governor.queue_request("local", 10).unwrap();

    assert_eq!(metrics.get_counter("governor.tokens.consumed:resource=local"), 400);
    assert_eq!(metrics.get_counter("governor.rate_limit.queued:resource=local"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_and_circuit_events_become_metrics() {
    let (metrics, observer) = observed();
    let breaker = Arc::new(
        CircuitBreaker::new(CircuitBreakerConfig::default().failure_threshold(1))
            .with_observer(observer.clone()),
    );
    let executor = RetryExecutor::new(
        RetryConfig::default()
            .max_retries(2)
            .initial_delay(Duration::from_millis(5))
            .jitter_factor(0.0),
        breaker.clone(),
    )
    .with_observer(observer);

    let outcome: RetryOutcome<()> = executor
        .execute("inference", || async { Err(ProviderError::rate_limited("slow down")) })
        .await;
    assert!(outcome.result.is_err());

    assert_eq!(
        metrics.get_counter("governor.retry.attempts:operation=inference,error=rate_limit_error"),
        2
    );
    assert_eq!(metrics.get_gauge(metric_names::CIRCUIT_BREAKER_STATE), Some(1.0));

    breaker.reset();
    assert_eq!(metrics.get_gauge(metric_names::CIRCUIT_BREAKER_STATE), Some(0.0));
}

#[test]
fn test_noop_collector_behind_observer() {
    let observer = MetricsObserver::new(Arc::new(NoopMetricsCollector));
    let governor = RateGovernor::new(RateGovernorConfig::default()).with_observer(Arc::new(observer));
    governor.consume_limit("claude-3-haiku", 10).unwrap();
}
