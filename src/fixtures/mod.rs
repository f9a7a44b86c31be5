//! Test fixtures: small, fast configurations.

use crate::config::{GovernorConfig, ResourceProfile};
use crate::resilience::{
    CircuitBreakerConfig, RateGovernorConfig, ResourceQuotaConfig, RetryConfig,
};
use crate::types::{InferenceRequest, Pricing};
use std::time::Duration;

/// Resource used by the fixtures
pub const TEST_RESOURCE: &str = "test-model";

/// Profile routed to [`TEST_RESOURCE`]
pub const TEST_PROFILE: &str = "tester";

/// Retry settings with millisecond delays and no jitter
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(80))
        .jitter_factor(0.0)
}

/// Generous quotas so admission never blocks
pub fn roomy_quota() -> ResourceQuotaConfig {
    ResourceQuotaConfig::new(1_000, 100_000, 1_000_000, 100_000_000)
}

/// Governor configuration with a single resource and profile
pub fn config_with_quota(quota: ResourceQuotaConfig) -> GovernorConfig {
    GovernorConfig {
        rate_limits: RateGovernorConfig::empty()
            .resource(TEST_RESOURCE, quota)
            .sweep_interval(Duration::from_millis(100)),
        retry: fast_retry(),
        circuit_breaker: CircuitBreakerConfig::default()
            .failure_threshold(3)
            .reset_timeout(Duration::from_secs(1)),
        profiles: [(
            TEST_PROFILE.to_string(),
            ResourceProfile::new(TEST_RESOURCE, 100),
        )]
        .into_iter()
        .collect(),
        pricing: [(TEST_RESOURCE.to_string(), Pricing::new(0.001, 0.002))]
            .into_iter()
            .collect(),
        ..GovernorConfig::default()
    }
}

/// Configuration that never throttles
pub fn test_config() -> GovernorConfig {
    config_with_quota(roomy_quota())
}

/// Request against [`TEST_PROFILE`] with a fixed cost
pub fn request(cost: u64) -> InferenceRequest {
    InferenceRequest::new(TEST_PROFILE, "Summarize the quarterly report").with_cost_override(cost)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_config_is_valid() {
        assert!(test_config().validate().is_ok());
        assert_eq!(
            test_config().resolve_profile(TEST_PROFILE).unwrap().resource,
            TEST_RESOURCE
        );
    }
}
