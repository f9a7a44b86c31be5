//! Request, response and usage types shared across the governor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Units consumed by a single provider call, as reported by the provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Units read from the payload (prompt tokens)
    pub input_units: u64,
    /// Units generated by the provider (completion tokens)
    pub output_units: u64,
}

impl Usage {
    /// Create a new Usage instance
    pub fn new(input_units: u64, output_units: u64) -> Self {
        Self {
            input_units,
            output_units,
        }
    }

    /// Get total units (input + output)
    pub fn total(&self) -> u64 {
        self.input_units + self.output_units
    }
}

/// Price of a resource in USD per thousand units
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    /// USD per 1K input units
    pub input_per_1k: f64,
    /// USD per 1K output units
    pub output_per_1k: f64,
}

impl Pricing {
    /// Create pricing from per-thousand rates
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Cost of the given usage in USD
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_units as f64 / 1000.0) * self.input_per_1k
            + (usage.output_units as f64 / 1000.0) * self.output_per_1k
    }
}

/// An inference request submitted to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    /// Profile name or resource name used to pick the throttling domain
    pub resource_selector: String,
    /// Opaque payload forwarded to the provider
    pub payload: String,
    /// Declared output ceiling; falls back to the profile default
    pub max_output_units: Option<u32>,
    /// Caller-supplied cost estimate, replacing the payload heuristic
    pub cost_override: Option<u64>,
    /// Free-form tags carried into logs
    pub metadata: BTreeMap<String, String>,
}

impl InferenceRequest {
    /// Create a request for the given selector and payload
    pub fn new(resource_selector: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            resource_selector: resource_selector.into(),
            payload: payload.into(),
            max_output_units: None,
            cost_override: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Set the declared output ceiling
    pub fn with_max_output_units(mut self, units: u32) -> Self {
        self.max_output_units = Some(units);
        self
    }

    /// Replace the estimated cost
    pub fn with_cost_override(mut self, units: u64) -> Self {
        self.cost_override = Some(units);
        self
    }

    /// Attach a metadata tag
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a successfully governed inference call
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    /// Identifier assigned at submission
    pub request_id: String,
    /// Resource the request was charged against
    pub resource: String,
    /// Provider payload
    pub payload: String,
    /// Usage reported by the provider
    pub usage: Usage,
    /// Units estimated before dispatch
    pub estimated_cost: u64,
    /// Units actually charged to the rate governor
    pub cost_actually_charged: u64,
    /// Cost in USD, zero when the resource has no pricing
    pub cost_usd: f64,
    /// Wall time from submission to completion, including queueing and retries
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_total() {
        assert_eq!(Usage::new(120, 80).total(), 200);
        assert_eq!(Usage::default().total(), 0);
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = Pricing::new(0.003, 0.015);
        let cost = pricing.cost(&Usage::new(2000, 1000));
        assert!((cost - 0.021).abs() < 1e-12);
    }

    #[test]
    fn test_request_builder() {
        let request = InferenceRequest::new("router", "classify this")
            .with_max_output_units(64)
            .with_cost_override(300)
            .with_metadata("stage", "ideation");

        assert_eq!(request.resource_selector, "router");
        assert_eq!(request.max_output_units, Some(64));
        assert_eq!(request.cost_override, Some(300));
        assert_eq!(request.metadata.get("stage").map(String::as_str), Some("ideation"));
    }

    #[test]
    fn test_usage_serde_camel_case() {
        let json = serde_json::to_value(Usage::new(1, 2)).unwrap();
        assert_eq!(json["inputUnits"], 1);
        assert_eq!(json["outputUnits"], 2);
    }
}
