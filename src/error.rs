//! Errors raised while recording data into a metrics context
//!
//! Every failure is surfaced synchronously from the mutating call that
//! introduced the invalid data. Nothing is deferred to flush time.
use thiserror::Error;

/// A record call failed one of the embedded metric format constraints
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// A dimension set held more entries than a single metric supports
    #[error("dimension set must not exceed {limit} dimensions, got {count}")]
    DimensionSetExceeded { count: usize, limit: usize },
    /// A dimension key or value failed character set, length, or
    /// emptiness checks
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),
    /// A metric name or value failed checks, or the storage resolution
    /// conflicts with an earlier write of the same name
    #[error("invalid metric: {0}")]
    InvalidMetric(String),
    /// The namespace failed length, character set, or emptiness checks
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
    /// The timestamp falls outside the accepted past/future window
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
