//! Configuration for the inference governor.
//!
//! Every section carries documented defaults. Partial settings can be layered
//! on top through the builder, environment variables, or a JSON document in
//! which missing keys fall back to the defaults.

use crate::errors::{GovernorError, GovernorResult};
use crate::resilience::{
    CircuitBreakerConfig, QuotaOverrides, RateGovernorConfig, ResourceQuotaConfig, RetryConfig,
};
use crate::types::Pricing;
use crate::{
    DEFAULT_LEDGER_CAPACITY, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_OUTPUT_UNITS,
    MAX_CONCURRENCY_CEILING, MIN_CONCURRENCY_CEILING,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Named settings a request selects by `resource_selector`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    /// Resource the profile is throttled and charged against
    pub resource: String,
    /// Output ceiling used when the request declares none
    pub default_max_output_units: u32,
    /// Pricing override; falls back to the resource's pricing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
}

impl ResourceProfile {
    /// Create a profile for `resource`
    pub fn new(resource: impl Into<String>, default_max_output_units: u32) -> Self {
        Self {
            resource: resource.into(),
            default_max_output_units,
            pricing: None,
        }
    }

    /// Set a profile-specific price
    pub fn pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }
}

/// Complete governor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GovernorConfig {
    /// Per-resource quotas and sweep settings
    pub rate_limits: RateGovernorConfig,
    /// Retry behavior
    pub retry: RetryConfig,
    /// Circuit breaker behavior
    pub circuit_breaker: CircuitBreakerConfig,
    /// Profiles keyed by selector
    pub profiles: BTreeMap<String, ResourceProfile>,
    /// Pricing keyed by resource
    pub pricing: BTreeMap<String, Pricing>,
    /// Initial global ceiling on in-flight provider calls
    pub max_concurrent_requests: usize,
    /// Lowest ceiling accepted at runtime
    pub min_concurrent_requests: usize,
    /// Highest ceiling accepted at runtime
    pub concurrency_ceiling: usize,
    /// Finalized ledger entries retained for aggregation
    pub ledger_capacity: usize,
    /// Output ceiling for selectors naming a resource directly
    pub default_max_output_units: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let profiles = [
            ("developer", "claude-3-5-sonnet", 4096),
            ("auditor", "claude-3-opus", 3000),
            ("router", "claude-3-haiku", 500),
            ("analyzer", "claude-3-5-sonnet", 4096),
        ]
        .into_iter()
        .map(|(name, resource, max_output)| {
            (name.to_string(), ResourceProfile::new(resource, max_output))
        })
        .collect();

        let pricing = [
            ("claude-3-opus", Pricing::new(0.015, 0.075)),
            ("claude-3-5-sonnet", Pricing::new(0.003, 0.015)),
            ("claude-3-haiku", Pricing::new(0.00025, 0.00125)),
        ]
        .into_iter()
        .map(|(resource, pricing)| (resource.to_string(), pricing))
        .collect();

        Self {
            rate_limits: RateGovernorConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            profiles,
            pricing,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            min_concurrent_requests: MIN_CONCURRENCY_CEILING,
            concurrency_ceiling: MAX_CONCURRENCY_CEILING,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            default_max_output_units: DEFAULT_MAX_OUTPUT_UNITS,
        }
    }
}

impl GovernorConfig {
    /// Creates a new configuration builder starting from the defaults
    pub fn builder() -> GovernorConfigBuilder {
        GovernorConfigBuilder::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults:
    /// `GOVERNOR_MAX_RETRIES`, `GOVERNOR_INITIAL_DELAY_MS`, `GOVERNOR_MAX_DELAY_MS`,
    /// `GOVERNOR_MAX_CONCURRENT_REQUESTS`, `GOVERNOR_SWEEP_INTERVAL_MS`,
    /// `GOVERNOR_CIRCUIT_THRESHOLD`, `GOVERNOR_CIRCUIT_RESET_MS`.
    pub fn from_env() -> GovernorResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GovernorResult<Self> {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(v) = parsed("GOVERNOR_MAX_RETRIES") {
            config.retry.max_retries = v as u32;
        }
        if let Some(v) = parsed("GOVERNOR_INITIAL_DELAY_MS") {
            config.retry.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed("GOVERNOR_MAX_DELAY_MS") {
            config.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed("GOVERNOR_MAX_CONCURRENT_REQUESTS") {
            config.max_concurrent_requests = v as usize;
        }
        if let Some(v) = parsed("GOVERNOR_SWEEP_INTERVAL_MS") {
            config.rate_limits.sweep_interval = Duration::from_millis(v);
        }
        if let Some(v) = parsed("GOVERNOR_CIRCUIT_THRESHOLD") {
            config.circuit_breaker.failure_threshold = v as u32;
        }
        if let Some(v) = parsed("GOVERNOR_CIRCUIT_RESET_MS") {
            config.circuit_breaker.reset_timeout = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document; missing keys keep their defaults
    pub fn from_json(json: &str) -> GovernorResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            GovernorError::configuration(format!("invalid governor configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section for values the governor cannot operate with
    pub fn validate(&self) -> GovernorResult<()> {
        self.rate_limits.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;

        if self.min_concurrent_requests == 0 {
            return Err(GovernorError::configuration(
                "minimum concurrency must be at least 1",
            ));
        }
        if self.min_concurrent_requests > self.concurrency_ceiling {
            return Err(GovernorError::configuration(format!(
                "concurrency bounds [{}, {}] are inverted",
                self.min_concurrent_requests, self.concurrency_ceiling
            )));
        }
        if !(self.min_concurrent_requests..=self.concurrency_ceiling)
            .contains(&self.max_concurrent_requests)
        {
            return Err(GovernorError::configuration(format!(
                "max concurrent requests {} outside [{}, {}]",
                self.max_concurrent_requests,
                self.min_concurrent_requests,
                self.concurrency_ceiling
            )));
        }
        if self.ledger_capacity == 0 {
            return Err(GovernorError::configuration(
                "ledger capacity must be at least 1",
            ));
        }

        for (name, profile) in &self.profiles {
            if !self.rate_limits.resources.contains_key(&profile.resource) {
                return Err(GovernorError::configuration(format!(
                    "profile '{}' references unknown resource '{}'",
                    name, profile.resource
                )));
            }
        }
        Ok(())
    }

    /// Resolves a selector to the profile it names.
    ///
    /// A selector naming a configured resource directly gets a profile with
    /// `default_max_output_units`. Pricing is filled in from the resource.
    pub fn resolve_profile(&self, selector: &str) -> GovernorResult<ResourceProfile> {
        let mut profile = if let Some(profile) = self.profiles.get(selector) {
            profile.clone()
        } else if self.rate_limits.resources.contains_key(selector) {
            ResourceProfile::new(selector, self.default_max_output_units)
        } else {
            return Err(GovernorError::configuration(format!(
                "unknown resource selector '{}'",
                selector
            )));
        };

        if profile.pricing.is_none() {
            profile.pricing = self.pricing.get(&profile.resource).copied();
        }
        Ok(profile)
    }
}

/// Builder for GovernorConfig
#[derive(Debug, Default)]
pub struct GovernorConfigBuilder {
    config: GovernorConfig,
}

impl GovernorConfigBuilder {
    /// Replaces all rate limit settings
    pub fn rate_limits(mut self, rate_limits: RateGovernorConfig) -> Self {
        self.config.rate_limits = rate_limits;
        self
    }

    /// Adds or replaces a resource
    pub fn resource(mut self, name: impl Into<String>, quota: ResourceQuotaConfig) -> Self {
        self.config.rate_limits.resources.insert(name.into(), quota);
        self
    }

    /// Merges partial quotas onto an existing resource
    pub fn override_resource(mut self, name: &str, overrides: QuotaOverrides) -> Self {
        self.config.rate_limits = self.config.rate_limits.override_resource(name, &overrides);
        self
    }

    /// Sets the queue sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.rate_limits.sweep_interval = interval;
        self
    }

    /// Sets the retry configuration
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets the circuit breaker configuration
    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = circuit_breaker;
        self
    }

    /// Adds or replaces a profile
    pub fn profile(mut self, name: impl Into<String>, profile: ResourceProfile) -> Self {
        self.config.profiles.insert(name.into(), profile);
        self
    }

    /// Removes every profile, leaving only direct resource selectors
    pub fn clear_profiles(mut self) -> Self {
        self.config.profiles.clear();
        self
    }

    /// Sets pricing for a resource
    pub fn pricing(mut self, resource: impl Into<String>, pricing: Pricing) -> Self {
        self.config.pricing.insert(resource.into(), pricing);
        self
    }

    /// Sets the initial concurrency ceiling
    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.config.max_concurrent_requests = n;
        self
    }

    /// Sets the bounds accepted when changing the ceiling at runtime
    pub fn concurrency_bounds(mut self, min: usize, max: usize) -> Self {
        self.config.min_concurrent_requests = min;
        self.config.concurrency_ceiling = max;
        self
    }

    /// Sets how many finalized requests the ledger keeps
    pub fn ledger_capacity(mut self, capacity: usize) -> Self {
        self.config.ledger_capacity = capacity;
        self
    }

    /// Sets the output ceiling for direct resource selectors
    pub fn default_max_output_units(mut self, units: u32) -> Self {
        self.config.default_max_output_units = units;
        self
    }

    /// Builds and validates the configuration
    pub fn build(self) -> GovernorResult<GovernorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
