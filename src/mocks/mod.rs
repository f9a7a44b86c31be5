//! Mock providers for testing.
//!
//! `ScriptedProvider` replays a queue of outcomes and records every call;
//! `MockInferenceProvider` is the mockall variant for expectation-style tests.

use crate::errors::ProviderError;
use crate::provider::{InferenceProvider, ProviderCall, ProviderResponse};
use crate::types::Usage;
use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Outcome = Result<ProviderResponse, ProviderError>;

/// Provider replaying scripted outcomes, then a fallback
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    calls: Mutex<Vec<ProviderCall>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    /// Provider answering `"ok"` with no reported usage
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(ProviderResponse::new("ok", Usage::default()))),
            calls: Mutex::new(Vec::new()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep for `latency` inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer every unscripted call with `usage`
    pub fn always_usage(self, usage: Usage) -> Self {
        *self.fallback.lock() = Ok(ProviderResponse::new("ok", usage));
        self
    }

    /// Fail every unscripted call with `error`
    pub fn always_fail(self, error: ProviderError) -> Self {
        *self.fallback.lock() = Err(error);
        self
    }

    /// Queue a success
    pub fn then_respond(self, payload: impl Into<String>, usage: Usage) -> Self {
        self.script
            .lock()
            .push_back(Ok(ProviderResponse::new(payload, usage)));
        self
    }

    /// Queue a failure
    pub fn then_fail(self, error: ProviderError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }

    /// Number of calls received
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of calls observed running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn complete(&self, call: ProviderCall) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().push(call);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }
}

mock! {
    pub InferenceProvider {}

    #[async_trait]
    impl InferenceProvider for InferenceProvider {
        async fn complete(&self, call: ProviderCall) -> Result<ProviderResponse, ProviderError>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(payload: &str) -> ProviderCall {
        ProviderCall {
            request_id: "req_test".to_string(),
            resource: "claude-3-haiku".to_string(),
            payload: payload.to_string(),
            max_output_units: 16,
        }
    }

    #[tokio::test]
    async fn test_scripted_provider_replays_then_falls_back() {
        let provider = ScriptedProvider::new()
            .then_fail(ProviderError::overloaded("busy"))
            .then_respond("first", Usage::new(1, 2))
            .always_usage(Usage::new(5, 5));

        assert!(provider.complete(call("a")).await.is_err());
        assert_eq!(provider.complete(call("b")).await.unwrap().payload, "first");
        assert_eq!(provider.complete(call("c")).await.unwrap().usage.total(), 10);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.calls()[2].payload, "c");
    }

    #[tokio::test]
    async fn test_mockall_provider() {
        let mut provider = MockInferenceProvider::new();
        provider
            .expect_complete()
            .times(1)
            .returning(|call| Ok(ProviderResponse::new(call.payload, Usage::new(3, 4))));

        let response = provider.complete(call("echo")).await.unwrap();
        assert_eq!(response.payload, "echo");
        assert_eq!(response.usage.total(), 7);
    }
}
