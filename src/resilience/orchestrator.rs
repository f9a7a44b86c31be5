use super::circuit_breaker::{CircuitBreaker, CircuitStatus};
use super::concurrency::ConcurrencyGate;
use super::hooks::{GovernanceObserver, Observers};
use super::rate_limiter::{RateGovernor, RateLimitStatus, SweeperHandle, UsageStats, UsageWindow};
use super::retry::{RetryConfig, RetryExecutor};
use crate::config::GovernorConfig;
use crate::errors::{GovernorError, GovernorResult, ProviderError};
use crate::ledger::{LedgerEntry, LedgerSummary, UsageLedger};
use crate::observability::{
    log_error, metric_names, MetricsCollector, MetricsObserver, NoopMetricsCollector,
};
use crate::provider::{InferenceProvider, ProviderCall};
use crate::types::{InferenceRequest, InferenceResponse};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const OPERATION: &str = "inference";

/// Heuristic cost of a request: roughly four characters per input unit plus
/// the declared output ceiling.
pub fn estimate_cost(payload: &str, max_output_units: u32) -> u64 {
    let chars = payload.chars().count() as u64;
    (chars + 3) / 4 + u64::from(max_output_units)
}

/// Root of the governor: admission, retries, concurrency and accounting
/// around a single [`InferenceProvider`].
pub struct RequestOrchestrator {
    config: GovernorConfig,
    provider: Arc<dyn InferenceProvider>,
    rate_governor: Arc<RateGovernor>,
    retry: RetryExecutor,
    concurrency: ConcurrencyGate,
    ledger: UsageLedger,
    metrics: Arc<dyn MetricsCollector>,
    active_requests: AtomicUsize,
    total_units: AtomicU64,
    _sweeper: Option<SweeperHandle>,
}

impl RequestOrchestrator {
    /// Create a builder starting from the default configuration
    pub fn builder() -> RequestOrchestratorBuilder {
        RequestOrchestratorBuilder::new()
    }

    /// Govern one inference request end to end.
    ///
    /// Resolves the selector, estimates cost, reserves admission (queueing
    /// when the resource is exhausted), runs the provider call through the
    /// retry executor under the global concurrency ceiling, then settles the
    /// reservation against the reported usage.
    #[instrument(
        name = "governor.process",
        skip(self, request),
        fields(selector = %request.resource_selector, request_id = tracing::field::Empty)
    )]
    pub async fn process(&self, request: InferenceRequest) -> GovernorResult<InferenceResponse> {
        let started = Instant::now();
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        tracing::Span::current().record("request_id", request_id.as_str());

        let profile = match self.config.resolve_profile(&request.resource_selector) {
            Ok(profile) => profile,
            Err(error) => {
                self.record_error(&request.resource_selector, &error);
                return Err(error);
            }
        };
        let resource = profile.resource.as_str();
        let max_output_units = request
            .max_output_units
            .unwrap_or(profile.default_max_output_units);
        let estimated = request
            .cost_override
            .unwrap_or_else(|| estimate_cost(&request.payload, max_output_units));

        self.metrics
            .increment_counter(metric_names::REQUEST_COUNT, 1, &[("resource", resource)]);
        let entry = self.ledger.open(request_id.as_str(), resource, estimated);
        debug!(resource, estimated, metadata = ?request.metadata, "Request submitted");

        if let Err(error) = self.admit(resource, estimated).await {
            self.record_error(resource, &error);
            entry.fail(&error);
            return Err(error);
        }

        let call = ProviderCall {
            request_id: request_id.clone(),
            resource: resource.to_string(),
            payload: request.payload,
            max_output_units,
        };
        let outcome = self
            .retry
            .execute(OPERATION, || {
                let call = call.clone();
                async move {
                    let _slot = match self.concurrency.acquire().await {
                        Ok(slot) => slot,
                        Err(error) => {
                            return Err(ProviderError::new(
                                "ConcurrencyGateClosed",
                                error.message(),
                            ))
                        }
                    };
                    let _active = ActiveRequest::enter(self);
                    self.provider.complete(call).await
                }
            })
            .await;

        let response = match outcome.result {
            Ok(response) => response,
            Err(error) => {
                // the request unit stays spent
                let _ = self.rate_governor.release_tokens(resource, estimated);
                self.record_error(resource, &error);
                entry.fail(&error);
                return Err(error);
            }
        };

        let reported = response.usage.total();
        let charged = if reported > 0 { reported } else { estimated };
        self.rate_governor.settle(resource, estimated, charged)?;
        self.total_units.fetch_add(charged, Ordering::Relaxed);

        let cost_usd = profile
            .pricing
            .map(|p| p.cost(&response.usage))
            .unwrap_or(0.0);
        entry.complete(charged, cost_usd);

        let duration = started.elapsed();
        self.metrics.record_histogram(
            metric_names::REQUEST_DURATION_MS,
            duration.as_secs_f64() * 1000.0,
            &[("resource", resource)],
        );
        info!(
            resource,
            estimated,
            charged,
            attempts = outcome.context.total_attempts,
            duration_ms = duration.as_millis() as u64,
            "Request completed"
        );

        Ok(InferenceResponse {
            request_id,
            resource: profile.resource.clone(),
            payload: response.payload,
            usage: response.usage,
            estimated_cost: estimated,
            cost_actually_charged: charged,
            cost_usd,
            duration,
        })
    }

    /// Reserve one request and `estimated` units, queueing if they do not fit
    async fn admit(&self, resource: &str, estimated: u64) -> GovernorResult<()> {
        if self.rate_governor.try_reserve(resource, estimated)? {
            return Ok(());
        }

        let ticket = self.rate_governor.queue_request(resource, estimated)?;
        ticket.wait().await?;
        debug!(resource, "Request admitted from queue");
        Ok(())
    }

    fn record_error(&self, resource: &str, error: &GovernorError) {
        self.metrics.increment_counter(
            metric_names::REQUEST_ERRORS,
            1,
            &[("resource", resource), ("kind", error.kind().as_str())],
        );
        log_error(error, resource);
    }

    /// Requests waiting for admission across all resources
    pub fn queue_size(&self) -> usize {
        self.rate_governor.total_queued()
    }

    /// Provider calls in flight.
    ///
    /// Requests waiting for admission, for a concurrency slot, or sleeping
    /// between retry attempts are not counted.
    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Units charged since construction
    pub fn total_units_processed(&self) -> u64 {
        self.total_units.load(Ordering::Relaxed)
    }

    /// Change the global concurrency ceiling; returns the clamped value in effect
    pub fn set_concurrency_limit(&self, limit: usize) -> usize {
        let effective = self.concurrency.set_limit(limit);
        if effective != limit {
            debug!(requested = limit, effective, "Concurrency limit clamped");
        }
        effective
    }

    /// Current global concurrency ceiling
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency.limit()
    }

    /// Admission status of every resource
    pub fn rate_limit_status(&self) -> BTreeMap<String, RateLimitStatus> {
        self.rate_governor.get_all_statuses()
    }

    /// Admission status of one resource
    pub fn resource_status(&self, resource: &str) -> GovernorResult<RateLimitStatus> {
        self.rate_governor.get_status(resource)
    }

    /// Circuit breaker snapshot
    pub fn circuit_status(&self) -> CircuitStatus {
        self.retry.circuit_breaker().status()
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        self.retry.circuit_breaker().reset();
    }

    /// Usage charged to `resource` within `window`
    pub fn usage_stats(&self, resource: &str, window: UsageWindow) -> GovernorResult<UsageStats> {
        self.rate_governor.get_usage_stats(resource, window)
    }

    /// Aggregated ledger totals
    pub fn ledger_summary(&self) -> LedgerSummary {
        self.ledger.summary()
    }

    /// Most recently finalized requests, newest first
    pub fn recent_requests(&self, limit: usize) -> Vec<LedgerEntry> {
        self.ledger.recent(limit)
    }

    /// Replace retry settings for subsequent requests
    pub fn update_retry_config(&self, config: RetryConfig) -> GovernorResult<()> {
        config.validate()?;
        self.retry.update_config(config);
        Ok(())
    }

    /// Rate governor backing admission
    pub fn rate_governor(&self) -> &Arc<RateGovernor> {
        &self.rate_governor
    }

    /// Configuration in effect
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("rate_governor", &self.rate_governor)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("ledger", &self.ledger)
            .field("active_requests", &self.active_requests())
            .field("total_units", &self.total_units_processed())
            .finish_non_exhaustive()
    }
}

struct ActiveRequest<'a> {
    orchestrator: &'a RequestOrchestrator,
}

impl<'a> ActiveRequest<'a> {
    fn enter(orchestrator: &'a RequestOrchestrator) -> Self {
        let active = orchestrator.active_requests.fetch_add(1, Ordering::Relaxed) + 1;
        orchestrator
            .metrics
            .set_gauge(metric_names::ACTIVE_REQUESTS, active as f64, &[]);
        Self { orchestrator }
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        let active = self
            .orchestrator
            .active_requests
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        self.orchestrator
            .metrics
            .set_gauge(metric_names::ACTIVE_REQUESTS, active as f64, &[]);
    }
}

/// Builder for [`RequestOrchestrator`]
pub struct RequestOrchestratorBuilder {
    config: GovernorConfig,
    provider: Option<Arc<dyn InferenceProvider>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    observers: Observers,
    spawn_sweeper: bool,
}

impl RequestOrchestratorBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: GovernorConfig::default(),
            provider: None,
            metrics: None,
            observers: Observers::default(),
            spawn_sweeper: true,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the provider being governed
    pub fn provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the metrics collector
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register an observer with every component
    pub fn observer(mut self, observer: Arc<dyn GovernanceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Leave queue sweeping to the caller via [`RateGovernor::sweep`]
    pub fn without_sweeper(mut self) -> Self {
        self.spawn_sweeper = false;
        self
    }

    /// Build the orchestrator.
    ///
    /// Spawning the sweeper requires a running Tokio runtime.
    pub fn build(self) -> GovernorResult<RequestOrchestrator> {
        self.config.validate()?;
        let provider = self
            .provider
            .ok_or_else(|| GovernorError::configuration("an inference provider is required"))?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(NoopMetricsCollector));

        let mut observers = self.observers;
        observers.push(Arc::new(MetricsObserver::new(metrics.clone())));

        let config = self.config;
        let rate_governor = Arc::new(
            RateGovernor::new(config.rate_limits.clone()).with_observers(observers.clone()),
        );
        let circuit_breaker = Arc::new(
            CircuitBreaker::new(config.circuit_breaker.clone()).with_observers(observers.clone()),
        );
        let retry = RetryExecutor::new(config.retry.clone(), circuit_breaker)
            .with_observers(observers.clone());
        let concurrency = ConcurrencyGate::new(
            config.max_concurrent_requests,
            config.min_concurrent_requests,
            config.concurrency_ceiling,
        )
        .with_observers(observers);

        let sweeper = if self.spawn_sweeper {
            tokio::runtime::Handle::try_current().map_err(|_| {
                GovernorError::configuration("the queue sweeper requires a Tokio runtime")
            })?;
            Some(rate_governor.spawn_sweeper())
        } else {
            None
        };

        info!(
            resources = config.rate_limits.resources.len(),
            max_concurrent_requests = config.max_concurrent_requests,
            "Request orchestrator ready"
        );

        Ok(RequestOrchestrator {
            ledger: UsageLedger::new(config.ledger_capacity),
            config,
            provider,
            rate_governor,
            retry,
            concurrency,
            metrics,
            active_requests: AtomicUsize::new(0),
            total_units: AtomicU64::new(0),
            _sweeper: sweeper,
        })
    }
}

impl Default for RequestOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
