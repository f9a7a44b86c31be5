//! The outbound provider call.
//!
//! The governor never speaks a wire protocol itself. A provider takes a
//! prepared call and either returns a response with reported usage, which is
//! reconciled into the rate governor as ground truth, or fails with a
//! [`ProviderError`] that the retry executor classifies.

use crate::errors::ProviderError;
use crate::types::Usage;
use async_trait::async_trait;

/// A single call dispatched to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Identifier of the governed request
    pub request_id: String,
    /// Resource the call is charged against (typically a model name)
    pub resource: String,
    /// Opaque payload
    pub payload: String,
    /// Output ceiling the provider should respect
    pub max_output_units: u32,
}

/// A provider response together with its reported usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    /// Opaque response payload
    pub payload: String,
    /// Usage reported by the provider
    pub usage: Usage,
}

impl ProviderResponse {
    /// Create a response
    pub fn new(payload: impl Into<String>, usage: Usage) -> Self {
        Self {
            payload: payload.into(),
            usage,
        }
    }
}

/// Trait for the inference backend being governed
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Perform one call. Timeouts are the provider's concern.
    async fn complete(&self, call: ProviderCall) -> Result<ProviderResponse, ProviderError>;
}
