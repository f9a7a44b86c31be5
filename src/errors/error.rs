//! Error types for governed inference calls.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for governor operations
pub type GovernorResult<T> = Result<T, GovernorError>;

/// Failure returned by the provider call.
///
/// The provider is opaque to the governor, so a failure is described only by
/// a name, a message and an optional status code. Retry classification matches
/// configured patterns against all three.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct ProviderError {
    /// Error name or type reported by the provider (e.g. `rate_limit_error`)
    pub name: String,
    /// Human readable message
    pub message: String,
    /// Status code, when the provider speaks HTTP
    pub status: Option<u16>,
}

impl ProviderError {
    /// Create a provider error with a name and message
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Attach a status code
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Provider-side throttling (429)
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new("rate_limit_error", message).with_status(429)
    }

    /// Provider is overloaded (529)
    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new("overloaded_error", message).with_status(529)
    }

    /// Server-side failure with the given status
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new("api_error", message).with_status(status)
    }

    /// Connection level failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new("network_error", message)
    }

    /// The call timed out
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("timeout_error", message)
    }

    /// The provider rejected the request itself (400)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request_error", message).with_status(400)
    }

    /// Credentials were rejected (401)
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new("authentication_error", message).with_status(401)
    }
}

/// Coarse classification of a [`GovernorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid resource selector or settings
    Configuration,
    /// The circuit breaker rejected the call without invoking the provider
    CircuitOpen,
    /// The provider returned a non-retryable error
    Terminal,
    /// Every attempt failed with a retryable error
    RetriesExhausted,
    /// The admission queue went away while the caller was waiting
    QueueClosed,
}

impl ErrorKind {
    /// Stable lowercase name, suitable for metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Terminal => "terminal",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::QueueClosed => "queue_closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the governor.
#[derive(Error, Debug, Clone)]
pub enum GovernorError {
    /// Configuration error (unknown resource selector, invalid settings)
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// The circuit breaker is open and the call was rejected
    #[error("Circuit breaker is open - service unavailable")]
    CircuitOpen {
        /// Time until the breaker will admit a trial call
        retry_in: Option<Duration>,
    },

    /// Terminal provider error, surfaced on first occurrence
    #[error("Provider error: {source}")]
    Provider {
        /// Error reported by the provider
        source: ProviderError,
    },

    /// Retryable provider errors persisted past the retry budget
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        last: ProviderError,
    },

    /// The waiter was dropped from the admission queue before release
    #[error("Admission queue for '{resource}' closed before release")]
    QueueClosed {
        /// Resource the caller was queued on
        resource: String,
    },
}

impl GovernorError {
    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        GovernorError::Configuration {
            message: message.into(),
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GovernorError::Configuration { .. } => ErrorKind::Configuration,
            GovernorError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GovernorError::Provider { .. } => ErrorKind::Terminal,
            GovernorError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            GovernorError::QueueClosed { .. } => ErrorKind::QueueClosed,
        }
    }

    /// Returns true if submitting the same request later may succeed.
    ///
    /// Open circuits and exhausted retries describe a struggling dependency;
    /// terminal provider errors and configuration errors will fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GovernorError::CircuitOpen { .. } | GovernorError::RetriesExhausted { .. }
        )
    }

    /// Human readable description, without the kind prefix
    pub fn message(&self) -> String {
        match self {
            GovernorError::Configuration { message } => message.clone(),
            GovernorError::Provider { source } => source.message.clone(),
            GovernorError::RetriesExhausted { last, .. } => last.message.clone(),
            other => other.to_string(),
        }
    }

    /// The provider error behind this failure, if any
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            GovernorError::Provider { source } => Some(source),
            GovernorError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Returns the time until the breaker admits a trial call, if known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GovernorError::CircuitOpen { retry_in } => *retry_in,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            GovernorError::configuration("bad").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            GovernorError::CircuitOpen { retry_in: None }.kind(),
            ErrorKind::CircuitOpen
        );
        assert_eq!(
            GovernorError::Provider {
                source: ProviderError::invalid_request("bad prompt"),
            }
            .kind(),
            ErrorKind::Terminal
        );
        assert_eq!(
            GovernorError::RetriesExhausted {
                attempts: 4,
                last: ProviderError::overloaded("busy"),
            }
            .kind(),
            ErrorKind::RetriesExhausted
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(GovernorError::CircuitOpen { retry_in: None }.is_retryable());
        assert!(GovernorError::RetriesExhausted {
            attempts: 2,
            last: ProviderError::network("reset"),
        }
        .is_retryable());
        assert!(!GovernorError::configuration("unknown selector").is_retryable());
        assert!(!GovernorError::Provider {
            source: ProviderError::authentication("bad key"),
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let open = GovernorError::CircuitOpen {
            retry_in: Some(Duration::from_secs(12)),
        };
        assert_eq!(open.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(GovernorError::configuration("x").retry_after(), None);
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::server(503, "Service unavailable");
        assert_eq!(err.to_string(), "api_error: Service unavailable");
        assert_eq!(err.status, Some(503));

        let wrapped = GovernorError::Provider { source: err.clone() };
        assert_eq!(wrapped.provider_error(), Some(&err));
        assert!(wrapped.to_string().contains("Service unavailable"));
    }

    #[test]
    fn test_message_strips_prefix() {
        assert_eq!(GovernorError::configuration("unknown selector 'x'").message(), "unknown selector 'x'");
        let exhausted = GovernorError::RetriesExhausted {
            attempts: 4,
            last: ProviderError::timeout("deadline"),
        };
        assert_eq!(exhausted.message(), "deadline");
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(ErrorKind::RetriesExhausted.as_str(), "retries_exhausted");
    }
}
