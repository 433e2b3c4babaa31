//! The user facing logging interface
//!
//! A [MetricsLogger] owns a [MetricsContext] and flushes it to the sink
//! chosen by environment detection. After each flush the logger keeps
//! recording into an independent copy of the context, so namespace,
//! properties, and dimensions carry over between measurement windows.
use crate::config::{self, Config};
use crate::context::{DimensionSet, MetricsContext, StorageResolution, Unit};
use crate::env::{Detector, Environment};
use crate::error::ValidationError;
use crate::sink::Sink;
use maplit::btreemap;
use serde_json::Value;
use std::time::SystemTime;

/// Run a function against a fresh logger, flushing when it returns
///
/// # example
/// ```rust,edition2018,no_run
/// use emf_metrics::{metric_scope, Unit, ValidationError, dimensions};
///
/// # fn main() -> Result<(), ValidationError> {
/// metric_scope(|metrics| -> Result<(), ValidationError> {
///    metrics.put_dimensions(dimensions! {
///        "Service" => "Aggregator"
///    })?;
///    metrics.put_metric("ProcessingLatency", 100, Unit::Milliseconds)?;
///    metrics.set_property("RequestId", "422b1569-16f6-4a03-b8f0-fe3fd9b100f8");
///    Ok(())
/// })
/// # }
/// ```
pub fn metric_scope<T>(mut f: impl FnMut(&mut MetricsLogger) -> T) -> T {
    f(&mut MetricsLogger::create())
}

struct ResolvedEnvironment {
    environment: Box<dyn Environment>,
    sink: Box<dyn Sink>,
}

/// Buffers metrics for one logical unit of work and flushes them as
/// embedded metric format events
pub struct MetricsLogger {
    context: MetricsContext,
    config: Config,
    // environment detection may probe the network, so it is deferred to
    // the first flush and reused afterwards
    resolved: Option<ResolvedEnvironment>,
    flush_preserve_dimensions: bool,
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        if !self.context.metrics.is_empty() {
            self.flush()
        }
    }
}

impl MetricsLogger {
    /// Create a new `MetricsLogger` configured from the environment
    pub fn create() -> MetricsLogger {
        let config = config::get();
        MetricsLogger {
            context: MetricsContext::with_config(&config),
            config,
            resolved: None,
            flush_preserve_dimensions: true,
        }
    }

    /// Flush the accumulated state to the environment's sink
    ///
    /// Default dimensions derived from the environment are applied here,
    /// just before serialization, so detection that completed after
    /// recording started still takes effect. The logger then continues
    /// with a fresh copy of the context.
    pub fn flush(&mut self) {
        let config = self.config.clone();
        let resolved = self.resolved.get_or_insert_with(|| {
            let environment = Detector::detect(&config);
            let sink = environment.sink();
            ResolvedEnvironment { environment, sink }
        });

        let environment = &resolved.environment;
        let mut default_dimensions: DimensionSet = btreemap! {
            "ServiceName".to_string() => environment.name().into_owned(),
            "ServiceType".to_string() => environment.env_type().into_owned(),
        };
        let log_group = environment.log_group_name();
        if !log_group.is_empty() {
            default_dimensions.insert("LogGroup".into(), log_group.into_owned());
        }
        self.context.set_default_dimensions(default_dimensions);
        environment.configure(&mut self.context);

        let next = self
            .context
            .create_copy_with_context(self.flush_preserve_dimensions);
        let current = std::mem::replace(&mut self.context, next);
        resolved.sink.accept(current);
    }

    /// Override the default metric namespace
    pub fn set_namespace(
        &mut self,
        namespace: impl Into<String>,
    ) -> Result<&mut Self, ValidationError> {
        self.context.set_namespace(namespace)?;
        Ok(self)
    }

    /// Set a request property on the emitted events
    ///
    /// Properties are available for querying in CloudWatch Logs Insights
    /// but are not charged as metric dimensions.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.context.set_property(name, value);
        self
    }

    /// Add a set of metric dimensions, replacing any earlier set with
    /// the same keys
    pub fn put_dimensions(
        &mut self,
        dimensions: DimensionSet,
    ) -> Result<&mut Self, ValidationError> {
        self.context.put_dimensions(dimensions)?;
        Ok(self)
    }

    /// Overwrite all dimension sets, optionally keeping the
    /// environment's default dimensions merged in
    pub fn set_dimensions(
        &mut self,
        dimension_sets: Vec<DimensionSet>,
        use_default: bool,
    ) -> Result<&mut Self, ValidationError> {
        self.context.set_dimensions(dimension_sets, use_default)?;
        Ok(self)
    }

    /// Clear all custom dimensions
    pub fn reset_dimensions(
        &mut self,
        use_default: bool,
    ) -> &mut Self {
        self.context.reset_dimensions(use_default);
        self
    }

    /// Add a standard resolution metric value to the metric event
    ///
    /// You can add up to 100 metrics per emitted event; anything beyond
    /// that batches into further events on flush.
    pub fn put_metric(
        &mut self,
        name: impl Into<String>,
        value: impl Into<f64>,
        unit: Unit,
    ) -> Result<&mut Self, ValidationError> {
        self.put_metric_with_resolution(name, value, unit, StorageResolution::Standard)
    }

    /// Add a metric value stored at the given resolution
    pub fn put_metric_with_resolution(
        &mut self,
        name: impl Into<String>,
        value: impl Into<f64>,
        unit: Unit,
        storage_resolution: StorageResolution,
    ) -> Result<&mut Self, ValidationError> {
        self.context
            .put_metric(name, value, unit, storage_resolution)?;
        Ok(self)
    }

    /// Pin the timestamp reported with every subsequent flush
    pub fn set_timestamp(
        &mut self,
        timestamp: SystemTime,
    ) -> Result<&mut Self, ValidationError> {
        self.context.set_timestamp(timestamp)?;
        Ok(self)
    }

    /// Control whether custom dimensions survive a flush
    pub fn flush_preserve_dimensions(
        &mut self,
        preserve: bool,
    ) -> &mut Self {
        self.flush_preserve_dimensions = preserve;
        self
    }

    /// Create a new logger flushing independently of this one while
    /// sharing its contextual data
    pub fn new_child(&self) -> MetricsLogger {
        MetricsLogger {
            context: self.context.create_copy_with_context(true),
            config: self.config.clone(),
            resolved: None,
            flush_preserve_dimensions: self.flush_preserve_dimensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_scope_api() {
        assert_eq!(
            metric_scope(|metrics: &mut MetricsLogger| {
                metrics.put_metric("foo", 1, Unit::Count).unwrap();
                1
            }),
            1
        )
    }

    #[test]
    fn logger_methods_chain() {
        let mut logger = MetricsLogger::create();
        logger
            .set_namespace("chained")
            .unwrap()
            .set_property("RequestId", "abc")
            .put_metric("latency", 7, Unit::Milliseconds)
            .unwrap()
            .put_metric_with_resolution("spikes", 1, Unit::Count, StorageResolution::High)
            .unwrap();
        assert_eq!(logger.context.namespace, "chained");
        assert_eq!(logger.context.metrics.len(), 2);
        // avoid flushing to a live sink on drop
        logger.context.metrics.clear();
    }

    #[test]
    fn child_logger_shares_context_but_not_metrics() {
        let mut logger = MetricsLogger::create();
        logger
            .set_namespace("parent")
            .unwrap()
            .set_property("RequestId", "abc")
            .put_metric("latency", 7, Unit::Milliseconds)
            .unwrap();

        let child = logger.new_child();
        assert_eq!(child.context.namespace, "parent");
        assert_eq!(child.context.properties["RequestId"], "abc");
        assert!(child.context.metrics.is_empty());

        logger.context.metrics.clear();
    }

    #[test]
    fn validation_failures_surface_at_the_call() {
        let mut logger = MetricsLogger::create();
        assert!(logger.set_namespace("").is_err());
        assert!(logger.put_metric("m".repeat(1025), 1, Unit::None).is_err());
        assert!(logger
            .put_dimensions(crate::dimensions! { ":bad" => "value" })
            .is_err());
    }
}
