use super::circuit_breaker::CircuitBreaker;
use super::hooks::{GovernanceObserver, Observers};
use crate::errors::{GovernorError, GovernorResult, ProviderError};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(rename = "initialDelayMs", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay, before jitter
    #[serde(rename = "maxDelayMs", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter_factor: f64,
    /// Patterns marking a provider error as transient
    #[serde(rename = "retryableErrorPatterns")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            retryable_errors: [
                "rate_limit_error",
                "overloaded_error",
                "api_error",
                "network_error",
                "timeout_error",
                "429",
                "503",
                "504",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

impl RetryConfig {
    /// Set maximum retries
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Replace the retryable error patterns
    pub fn retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Pre-jitter delay after the attempt with zero-based index `attempt`:
    /// `min(max_delay, initial_delay * multiplier^attempt)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Perturb `base` by up to `±base * jitter_factor`
    pub fn apply_jitter<R: Rng + ?Sized>(&self, base: Duration, rng: &mut R) -> Duration {
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter_factor;
        let offset = rng.gen_range(-1.0..=1.0) * spread;
        Duration::from_millis((base_ms + offset).max(0.0).round() as u64)
    }

    /// Delay to sleep after the attempt with zero-based index `attempt`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.base_delay(attempt), &mut rand::thread_rng())
    }

    /// Classify a provider error against the configured patterns.
    ///
    /// An error is transient when its lowercased message or name contains a
    /// pattern, or its status code equals one.
    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        let message = error.message.to_lowercase();
        let name = error.name.to_lowercase();
        let status = error.status.map(|s| s.to_string());

        self.retryable_errors.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            message.contains(&pattern)
                || name.contains(&pattern)
                || status.as_deref() == Some(pattern.as_str())
        })
    }

    pub(crate) fn validate(&self) -> GovernorResult<()> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(GovernorError::configuration(format!(
                "jitter factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(GovernorError::configuration(format!(
                "backoff multiplier must be at least 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(GovernorError::configuration(
                "initial retry delay exceeds maximum delay",
            ));
        }
        Ok(())
    }
}

/// State of one `execute` call
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Zero-based index of the most recent attempt
    pub attempt: u32,
    /// Attempts made so far
    pub total_attempts: u32,
    /// Error returned by the most recent failed attempt
    pub last_error: Option<ProviderError>,
    /// Delay scheduled before the next attempt
    pub next_delay: Option<Duration>,
    /// When execution started
    pub start_time: Instant,
    /// When execution finished
    pub end_time: Option<Instant>,
}

impl RetryContext {
    fn start() -> Self {
        Self {
            attempt: 0,
            total_attempts: 0,
            last_error: None,
            next_delay: None,
            start_time: Instant::now(),
            end_time: None,
        }
    }

    fn finish(&mut self) {
        self.next_delay = None;
        self.end_time = Some(Instant::now());
    }

    /// Time spent so far, or in total once finished
    pub fn elapsed(&self) -> Duration {
        self.end_time
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.start_time)
    }
}

/// Result of an execution together with the context that produced it
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value or typed failure
    pub result: GovernorResult<T>,
    /// Attempt bookkeeping
    pub context: RetryContext,
}

impl<T> RetryOutcome<T> {
    /// Discard the context
    pub fn into_result(self) -> GovernorResult<T> {
        self.result
    }
}

/// Retry executor with exponential backoff, guarded by a shared circuit breaker
pub struct RetryExecutor {
    config: RwLock<RetryConfig>,
    circuit_breaker: Arc<CircuitBreaker>,
    observers: Observers,
}

impl RetryExecutor {
    /// Create a new retry executor routing through `circuit_breaker`
    pub fn new(config: RetryConfig, circuit_breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config: RwLock::new(config),
            circuit_breaker,
            observers: Observers::default(),
        }
    }

    /// Register an observer for retry events
    pub fn with_observer(mut self, observer: Arc<dyn GovernanceObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub(crate) fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Circuit breaker shared by every execution
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// Current retry settings
    pub fn config(&self) -> RetryConfig {
        self.config.read().clone()
    }

    /// Replace retry settings; executions already running keep their snapshot
    pub fn update_config(&self, config: RetryConfig) {
        *self.config.write() = config;
    }

    /// Run `f` until it succeeds, fails terminally, or exhausts `max_retries`.
    ///
    /// An open circuit rejects the call before `f` is invoked. The breaker
    /// records one outcome per execution.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut f: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let config = self.config();
        let mut context = RetryContext::start();

        if let Err(error) = self.circuit_breaker.try_acquire() {
            return self.fail(operation, context, error);
        }

        loop {
            context.attempt = context.total_attempts;
            context.total_attempts += 1;

            let error = match f().await {
                Ok(value) => {
                    self.circuit_breaker.record_success();
                    context.finish();
                    self.observers
                        .notify(|o| o.on_retry_success(operation, &context));
                    return RetryOutcome {
                        result: Ok(value),
                        context,
                    };
                }
                Err(error) => error,
            };

            context.last_error = Some(error.clone());

            if !config.is_retryable(&error) {
                self.circuit_breaker.record_failure();
                return self.fail(operation, context, GovernorError::Provider { source: error });
            }

            if context.attempt >= config.max_retries {
                self.circuit_breaker.record_failure();
                let attempts = context.total_attempts;
                return self.fail(
                    operation,
                    context,
                    GovernorError::RetriesExhausted {
                        attempts,
                        last: error,
                    },
                );
            }

            let delay = config.jittered_delay(context.attempt);
            context.next_delay = Some(delay);
            debug!(
                operation,
                attempt = context.total_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after transient error"
            );
            self.observers.notify(|o| {
                o.on_retry_attempt(operation, context.total_attempts, delay, &error)
            });

            sleep(delay).await;
        }
    }

    fn fail<T>(
        &self,
        operation: &str,
        mut context: RetryContext,
        error: GovernorError,
    ) -> RetryOutcome<T> {
        context.finish();
        self.observers
            .notify(|o| o.on_retry_failure(operation, &context, &error));
        RetryOutcome {
            result: Err(error),
            context,
        }
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &*self.config.read())
            .field("circuit_breaker", &self.circuit_breaker)
            .field("observers", &self.observers)
            .finish()
    }
}
