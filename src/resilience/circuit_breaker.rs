use super::hooks::{GovernanceObserver, Observers};
use crate::errors::{GovernorError, GovernorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Cooldown since the last failure before a trial call is admitted
    #[serde(rename = "resetTimeoutMs", with = "crate::config::duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set failure threshold
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set success threshold
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    /// Set reset timeout
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> GovernorResult<()> {
        if self.failure_threshold == 0 {
            return Err(GovernorError::configuration(
                "circuit breaker failure threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(GovernorError::configuration(
                "circuit breaker success threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for gauges (0=closed, 1=open, 2=half-open)
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes recorded in the current half-open period
    pub half_open_successes: u32,
    /// Time since the most recent failure
    pub since_last_failure: Option<Duration>,
    /// True when the circuit is open and its cooldown has elapsed
    pub can_attempt_reset: bool,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure: None,
        }
    }

    fn since_last_failure(&self, now: Instant) -> Option<Duration> {
        self.last_failure
            .map(|at| now.saturating_duration_since(at))
    }
}

/// Circuit breaker shared by every call routed through one executor.
///
/// Transitions:
/// - closed → open after `failure_threshold` consecutive failures
/// - open → half-open on the first admission after `reset_timeout` since the last failure
/// - half-open → closed after `success_threshold` consecutive successes
/// - half-open → open on any failure
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observers: Observers,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::closed()),
            observers: Observers::default(),
        }
    }

    /// Register an observer for state changes
    pub fn with_observer(mut self, observer: Arc<dyn GovernanceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub(crate) fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Admit or reject a call.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and admits
    /// the call; otherwise it is rejected with the remaining cooldown.
    ///
    /// Half-open does not limit trial calls: every caller arriving while
    /// half-open is admitted, and the first failure reopens the circuit.
    pub fn try_acquire(&self) -> GovernorResult<()> {
        let now = Instant::now();
        let failures = {
            let mut state = self.state.lock();
            if state.state != CircuitState::Open {
                return Ok(());
            }
            let elapsed = state.since_last_failure(now).unwrap_or(Duration::MAX);
            if elapsed < self.config.reset_timeout {
                return Err(GovernorError::CircuitOpen {
                    retry_in: Some(self.config.reset_timeout - elapsed),
                });
            }
            state.state = CircuitState::HalfOpen;
            state.half_open_successes = 0;
            state.consecutive_failures
        };

        info!("Circuit breaker half-open, admitting trial call");
        self.notify_state_change(CircuitState::Open, CircuitState::HalfOpen, failures);
        Ok(())
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get the time until the circuit will admit a trial call
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state
            .since_last_failure(Instant::now())
            .unwrap_or(Duration::MAX);
        Some(self.config.reset_timeout.saturating_sub(elapsed))
    }

    /// Snapshot for introspection
    pub fn status(&self) -> CircuitStatus {
        let state = self.state.lock();
        let since_last_failure = state.since_last_failure(Instant::now());
        CircuitStatus {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_successes: state.half_open_successes,
            since_last_failure,
            can_attempt_reset: state.state == CircuitState::Open
                && since_last_failure.map_or(true, |d| d >= self.config.reset_timeout),
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let closed = {
            let mut state = self.state.lock();
            state.consecutive_failures = 0;
            if state.state != CircuitState::HalfOpen {
                return;
            }
            state.half_open_successes += 1;
            if state.half_open_successes < self.config.success_threshold {
                return;
            }
            state.state = CircuitState::Closed;
            state.half_open_successes = 0;
            true
        };

        if closed {
            info!("Circuit breaker closed");
            self.notify_state_change(CircuitState::HalfOpen, CircuitState::Closed, 0);
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let transition = {
            let mut state = self.state.lock();
            state.consecutive_failures += 1;
            state.last_failure = Some(Instant::now());

            let from = state.state;
            let opens = match from {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => {
                    state.consecutive_failures >= self.config.failure_threshold
                }
                CircuitState::Open => false,
            };
            if opens {
                state.state = CircuitState::Open;
                state.half_open_successes = 0;
                Some((from, state.consecutive_failures))
            } else {
                None
            }
        };

        if let Some((from, failures)) = transition {
            warn!(
                failures,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            self.notify_state_change(from, CircuitState::Open, failures);
        }
    }

    /// Force the circuit closed and clear all counters
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::closed();
        info!("Circuit breaker manually reset");
        self.observers.notify(|o| o.on_circuit_reset());
    }

    /// Configuration in effect
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn notify_state_change(&self, from: CircuitState, to: CircuitState, failures: u32) {
        self.observers
            .notify(|o| o.on_circuit_state_change(from, to, failures));
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
