//! Error types for the inference governor.
//!
//! Admission denial is not an error: callers are queued until capacity frees.
//! Every other failure surfaces as a [`GovernorError`] whose [`ErrorKind`]
//! lets callers choose a degraded fallback.

mod error;

pub use error::{ErrorKind, GovernorError, GovernorResult, ProviderError};
