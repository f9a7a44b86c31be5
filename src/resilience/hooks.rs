//! Observer registration for governance events.
//!
//! Components accept observers at construction and invoke them synchronously
//! after the relevant state change, never while holding internal locks.
//! Observers must not block: a thread-based consumer should forward into a
//! channel, an async consumer can spawn.

use super::circuit_breaker::CircuitState;
use super::retry::RetryContext;
use crate::errors::{GovernorError, ProviderError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Receiver of governance notifications. Every method defaults to a no-op.
pub trait GovernanceObserver: Send + Sync {
    /// A caller was queued because the resource is out of quota
    fn on_request_queued(&self, _resource: &str, _queue_length: usize) {}

    /// A queued caller was released
    fn on_request_dequeued(&self, _resource: &str, _remaining: usize) {}

    /// Realized cost was charged to a resource
    fn on_limit_consumed(&self, _resource: &str, _units: u64) {}

    /// An attempt failed with a retryable error and will be retried after `delay`
    fn on_retry_attempt(
        &self,
        _operation: &str,
        _attempt: u32,
        _delay: Duration,
        _error: &ProviderError,
    ) {
    }

    /// An execution finished successfully
    fn on_retry_success(&self, _operation: &str, _context: &RetryContext) {}

    /// An execution finished with a failure
    fn on_retry_failure(&self, _operation: &str, _context: &RetryContext, _error: &GovernorError) {
    }

    /// The circuit breaker moved between states
    fn on_circuit_state_change(&self, _from: CircuitState, _to: CircuitState, _failures: u32) {}

    /// The circuit breaker was reset manually
    fn on_circuit_reset(&self) {}

    /// The global concurrency ceiling changed
    fn on_concurrency_limit_changed(&self, _limit: usize) {}
}

/// Observer that writes every event to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl GovernanceObserver for TracingObserver {
    fn on_request_queued(&self, resource: &str, queue_length: usize) {
        info!(resource, queue_length, "Request queued");
    }

    fn on_request_dequeued(&self, resource: &str, remaining: usize) {
        debug!(resource, remaining, "Request dequeued");
    }

    fn on_limit_consumed(&self, resource: &str, units: u64) {
        debug!(resource, units, "Limit consumed");
    }

    fn on_retry_attempt(&self, operation: &str, attempt: u32, delay: Duration, error: &ProviderError) {
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retry attempt scheduled"
        );
    }

    fn on_retry_success(&self, operation: &str, context: &RetryContext) {
        debug!(operation, attempts = context.total_attempts, "Operation succeeded");
    }

    fn on_retry_failure(&self, operation: &str, context: &RetryContext, error: &GovernorError) {
        warn!(
            operation,
            attempts = context.total_attempts,
            kind = %error.kind(),
            error = %error,
            "Operation failed"
        );
    }

    fn on_circuit_state_change(&self, from: CircuitState, to: CircuitState, failures: u32) {
        if to == CircuitState::Open {
            error!(%from, %to, failures, "Circuit breaker opened");
        } else {
            info!(%from, %to, failures, "Circuit breaker state changed");
        }
    }

    fn on_circuit_reset(&self) {
        info!("Circuit breaker reset");
    }

    fn on_concurrency_limit_changed(&self, limit: usize) {
        info!(limit, "Concurrency limit updated");
    }
}

/// Registered observers of one component
#[derive(Clone, Default)]
pub(crate) struct Observers {
    registered: Vec<Arc<dyn GovernanceObserver>>,
}

impl Observers {
    pub(crate) fn push(&mut self, observer: Arc<dyn GovernanceObserver>) {
        self.registered.push(observer);
    }

    pub(crate) fn notify(&self, event: impl Fn(&dyn GovernanceObserver)) {
        for observer in &self.registered {
            event(observer.as_ref());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registered.len()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("registered", &self.len())
            .finish()
    }
}
