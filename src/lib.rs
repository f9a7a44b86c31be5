//! # Inference Governor
//!
//! Client-side admission control for calls to a metered inference provider.
//!
//! ## Features
//!
//! - Four token buckets per resource (requests and token units, per minute and per hour)
//! - FIFO wait queue per resource, drained by a background sweeper
//! - Retry with exponential backoff and jitter, classified by error patterns
//! - Circuit breaker with half-open recovery
//! - Global ceiling on in-flight provider calls, adjustable at runtime
//! - Usage ledger with per-request cost accounting
//! - Observer hooks, structured logging and metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_inference_governor::{
//!     GovernorConfig, InferenceProvider, InferenceRequest, ProviderCall, ProviderError,
//!     ProviderResponse, RequestOrchestrator, Usage,
//! };
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl InferenceProvider for Echo {
//!     async fn complete(&self, call: ProviderCall) -> Result<ProviderResponse, ProviderError> {
//!         Ok(ProviderResponse::new(call.payload, Usage::new(10, 20)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = RequestOrchestrator::builder()
//!         .config(GovernorConfig::from_env()?)
//!         .provider(Arc::new(Echo))
//!         .build()?;
//!
//!     let response = orchestrator
//!         .process(InferenceRequest::new("router", "Classify this ticket"))
//!         .await?;
//!     println!("{} units, ${:.6}", response.cost_actually_charged, response.cost_usd);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `config` - Governor configuration, profiles and builder
//! - `errors` - Error types and classification
//! - `ledger` - Per-request usage accounting
//! - `observability` - Logging setup and metrics
//! - `provider` - The provider seam being governed
//! - `resilience` - Rate governor, retry, circuit breaker, concurrency gate and orchestrator
//! - `types` - Requests, responses, usage and pricing
//! - `mocks` - Mock providers for testing
//! - `fixtures` - Test fixtures

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod errors;
pub mod ledger;
pub mod observability;
pub mod provider;
pub mod resilience;
pub mod types;

// Development/testing modules
#[cfg(test)]
pub mod mocks;
#[cfg(test)]
pub mod fixtures;

/// Initial global ceiling on in-flight provider calls
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 5;

/// Lowest accepted concurrency ceiling
pub const MIN_CONCURRENCY_CEILING: usize = 1;

/// Highest accepted concurrency ceiling
pub const MAX_CONCURRENCY_CEILING: usize = 20;

/// Finalized ledger entries retained by default
pub const DEFAULT_LEDGER_CAPACITY: usize = 1000;

/// Output ceiling for selectors that name a resource directly
pub const DEFAULT_MAX_OUTPUT_UNITS: u32 = 1024;

// Re-exports for convenience
pub use config::{GovernorConfig, GovernorConfigBuilder, ResourceProfile};
pub use errors::{ErrorKind, GovernorError, GovernorResult, ProviderError};
pub use ledger::{EntryStatus, LedgerEntry, LedgerGuard, LedgerSummary, UsageLedger};
pub use observability::{
    metric_names, InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCollector,
    MetricsObserver, NoopMetricsCollector,
};
pub use provider::{InferenceProvider, ProviderCall, ProviderResponse};
pub use resilience::{
    estimate_cost, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus,
    ConcurrencyGate, GovernanceObserver, QueueTicket, QuotaOverrides, RateGovernor,
    RateGovernorConfig, RateLimitStatus, RequestOrchestrator, RequestOrchestratorBuilder,
    ResourceQuotaConfig, RetryConfig, RetryExecutor, TracingObserver, UsageStats, UsageWindow,
};
pub use types::{InferenceRequest, InferenceResponse, Pricing, Usage};
