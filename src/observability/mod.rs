//! Observability: structured logging setup and metrics.
//!
//! - **Logging**: `tracing-subscriber` initialisation with pretty, JSON or compact output
//! - **Metrics**: counters, histograms and gauges behind [`MetricsCollector`],
//!   fed by [`MetricsObserver`] and the orchestrator
//!
//! ```rust,no_run
//! use integrations_inference_governor::observability::{
//!     InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCollector,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//!
//! let metrics = InMemoryMetricsCollector::new();
//! metrics.increment_counter("governor.requests.total", 1, &[("resource", "claude-3-haiku")]);
//! # Ok(())
//! # }
//! ```

mod logging;
mod metrics;

#[cfg(test)]
mod tests;

pub use logging::*;
pub use metrics::*;
