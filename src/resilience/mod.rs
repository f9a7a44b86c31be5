//! Governance primitives and the orchestrator that composes them.
//!
//! Admission runs through the [`RateGovernor`], provider calls through the
//! [`RetryExecutor`] guarded by a [`CircuitBreaker`], and in-flight calls are
//! bounded by a [`ConcurrencyGate`].

mod circuit_breaker;
mod concurrency;
mod hooks;
mod orchestrator;
mod rate_limiter;
mod retry;

#[cfg(test)]
mod tests;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus};
pub use concurrency::{ConcurrencyGate, ConcurrencyPermit};
pub use hooks::{GovernanceObserver, TracingObserver};
pub(crate) use hooks::Observers;
pub use orchestrator::{estimate_cost, RequestOrchestrator, RequestOrchestratorBuilder};
pub use rate_limiter::{
    BucketLevels, BucketSnapshot, QueueTicket, QuotaOverrides, RateGovernor, RateGovernorConfig,
    RateLimitStatus, ResourceQuotaConfig, SweeperHandle, UsageStats, UsageWindow, WindowRemaining,
    WindowResets,
};
pub use retry::{RetryConfig, RetryContext, RetryExecutor, RetryOutcome};
