//! Provides an interface for recording high cardinality application metrics
//! using AWS CloudWatch embedded metrics
//!
//! # example
//!
//! ```rust,edition2018,no_run
//! use emf_metrics::{metric_scope, Unit, ValidationError, dimensions};
//!
//! # fn main() -> Result<(), ValidationError> {
//! metric_scope(|metrics| -> Result<(), ValidationError> {
//!    metrics.put_dimensions(dimensions! {
//!        "Service" => "Aggregator"
//!    })?;
//!    metrics.put_metric("ProcessingLatency", 100, Unit::Milliseconds)?;
//!    metrics.set_property("RequestId", "422b1569-16f6-4a03-b8f0-fe3fd9b100f8");
//!    Ok(())
//! })
//! # }
//! ```
pub mod context;
pub mod error;
// only pub for benches
#[doc(hidden)]
pub mod log;
#[doc(hidden)]
pub mod serialize;
mod config;
mod env;
mod sink;
mod validate;

pub use context::{DimensionSet, MetricsContext, StorageResolution, Unit};
pub use error::ValidationError;
pub use log::{metric_scope, MetricsLogger};

/// Build a [DimensionSet] from `"name" => "value"` pairs
#[macro_export]
macro_rules! dimensions {
    ($($key:expr => $value:expr,)+) => { $crate::dimensions!($($key => $value),+) };
    ($($key:expr => $value:expr),*) => {
        {
            let mut _map = ::std::collections::BTreeMap::new();
            $(
                let _ = _map.insert($key.into(), $value.into());
            )*
            _map
        }
    };
}
