//! Mutable accumulation state for a single flush cycle
//!
//! A [MetricsContext] has one logical owner. Callers record metrics,
//! dimensions, and properties through its methods; on flush the serializer
//! reads it and the logger replaces it via [MetricsContext::create_copy_with_context].
use crate::config::Config;
use crate::error::ValidationError;
use crate::validate;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::{debug, warn};

pub(crate) const DEFAULT_NAMESPACE: &str = "aws-embedded-metrics";

/// A complete combination of dimension name/value pairs under which
/// metrics are reported
pub type DimensionSet = BTreeMap<String, String>;

/// Metric unit types
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Unit {
    Seconds,
    Microseconds,
    Milliseconds,
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
    Terabytes,
    Bits,
    Kilobits,
    Megabits,
    Gigabits,
    Terabits,
    Percent,
    Count,
    #[serde(rename = "Bytes/Second")]
    BytesPerSecond,
    #[serde(rename = "Kilobytes/Second")]
    KilobytesPerSecond,
    #[serde(rename = "Megabytes/Second")]
    MegabytesPerSecond,
    #[serde(rename = "Gigabytes/Second")]
    GigabytesPerSecond,
    #[serde(rename = "Terabytes/Second")]
    TerabytesPerSecond,
    #[serde(rename = "Bits/Second")]
    BitsPerSecond,
    #[serde(rename = "Kilobits/Second")]
    KilobitsPerSecond,
    #[serde(rename = "Megabits/Second")]
    MegabitsPerSecond,
    #[serde(rename = "Gigabits/Second")]
    GigabitsPerSecond,
    #[serde(rename = "Terabits/Second")]
    TerabitsPerSecond,
    #[serde(rename = "Count/Second")]
    CountPerSecond,
    None,
}

impl Default for Unit {
    fn default() -> Unit {
        Unit::None
    }
}

/// Time granularity at which a metric's values are aggregated downstream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageResolution {
    /// 60 second granularity
    Standard,
    /// 1 second granularity
    High,
}

impl Default for StorageResolution {
    fn default() -> StorageResolution {
        StorageResolution::Standard
    }
}

/// One metric's accumulated samples along with its unit and storage
/// resolution
///
/// Samples are append-only within a flush cycle and keep their original
/// order. No upper bound is enforced here, the serializer splits large
/// sample sequences across payloads.
#[derive(Debug, Clone)]
pub struct MetricValues {
    pub(crate) values: Vec<f64>,
    pub(crate) unit: Unit,
    pub(crate) storage_resolution: StorageResolution,
}

impl MetricValues {
    fn new(
        value: f64,
        unit: Unit,
        storage_resolution: StorageResolution,
    ) -> MetricValues {
        MetricValues {
            values: vec![value],
            unit,
            storage_resolution,
        }
    }

    pub fn add_value(
        &mut self,
        value: f64,
    ) {
        self.values.push(value)
    }
}

/// Buffered metrics, dimensions, and properties awaiting a flush
#[derive(Debug, Clone)]
pub struct MetricsContext {
    pub(crate) namespace: String,
    pub(crate) properties: BTreeMap<String, Value>,
    /// Extra entries for the `_aws` envelope, injected by sinks
    /// (`LogGroupName`, `LogStreamName`)
    pub(crate) meta: BTreeMap<String, Value>,
    pub(crate) metrics: BTreeMap<String, MetricValues>,
    pub(crate) timestamp: SystemTime,
    dimensions: Vec<DimensionSet>,
    default_dimensions: DimensionSet,
    should_use_default_dimensions: bool,
}

impl Default for MetricsContext {
    fn default() -> MetricsContext {
        MetricsContext::empty()
    }
}

impl MetricsContext {
    /// Create a new, empty context with the built-in default namespace
    pub fn empty() -> MetricsContext {
        MetricsContext::new(DEFAULT_NAMESPACE.into())
    }

    /// Create a new, empty context taking its namespace from configuration
    pub(crate) fn with_config(config: &Config) -> MetricsContext {
        MetricsContext::new(config.namespace())
    }

    fn new(namespace: String) -> MetricsContext {
        MetricsContext {
            namespace,
            properties: BTreeMap::new(),
            meta: BTreeMap::new(),
            metrics: BTreeMap::new(),
            timestamp: SystemTime::now(),
            dimensions: Vec::new(),
            default_dimensions: DimensionSet::new(),
            should_use_default_dimensions: true,
        }
    }

    /// Replace the metric namespace
    pub fn set_namespace(
        &mut self,
        namespace: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let namespace = namespace.into();
        validate::validate_namespace(&namespace)?;
        self.namespace = namespace;
        Ok(())
    }

    /// Record a property emitted at the top level of every payload
    ///
    /// Properties overwrite unconditionally. A property sharing a name
    /// with a stored dimension key produces ambiguous output, so that
    /// case is logged but not rejected.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) {
        let name = name.into();
        if self.has_dimension_key(&name) {
            warn!(
                "property {} collides with a dimension key and will shadow its value",
                name
            );
        }
        self.properties.insert(name, value.into());
    }

    fn has_dimension_key(
        &self,
        key: &str,
    ) -> bool {
        self.default_dimensions.contains_key(key)
            || self.dimensions.iter().any(|set| set.contains_key(key))
    }

    /// Replace the default dimensions merged into every custom set at
    /// read time
    ///
    /// These come from environment detection and may arrive after
    /// recording has already started.
    pub fn set_default_dimensions(
        &mut self,
        dimensions: DimensionSet,
    ) {
        debug!("received {} default dimensions", dimensions.len());
        self.default_dimensions = dimensions;
    }

    /// Add a dimension set
    ///
    /// At most one set is kept per unique key combination: an existing
    /// set with the same keys is removed and the incoming set appended
    /// at the tail, so the most recent values win.
    pub fn put_dimensions(
        &mut self,
        dimensions: DimensionSet,
    ) -> Result<(), ValidationError> {
        validate::validate_dimension_set(&dimensions)?;
        self.dimensions
            .retain(|set| !set.keys().eq(dimensions.keys()));
        self.dimensions.push(dimensions);
        Ok(())
    }

    /// Overwrite all custom dimension sets
    ///
    /// `use_default` controls whether default dimensions are merged back
    /// in when the sets are read.
    pub fn set_dimensions(
        &mut self,
        dimension_sets: Vec<DimensionSet>,
        use_default: bool,
    ) -> Result<(), ValidationError> {
        for set in &dimension_sets {
            validate::validate_dimension_set(set)?;
        }
        self.should_use_default_dimensions = use_default;
        self.dimensions = dimension_sets;
        Ok(())
    }

    /// Clear all custom dimension sets
    pub fn reset_dimensions(
        &mut self,
        use_default: bool,
    ) {
        self.dimensions.clear();
        self.should_use_default_dimensions = use_default;
    }

    /// The dimension sets as they will be serialized
    ///
    /// Default dimensions are merged here, on the read path, because
    /// environment detection may deliver them after some dimensions were
    /// already recorded. Custom keys win on conflict.
    pub fn get_dimensions(&self) -> Vec<DimensionSet> {
        if !self.should_use_default_dimensions || self.default_dimensions.is_empty() {
            return self.dimensions.clone();
        }

        if self.dimensions.is_empty() {
            return vec![self.default_dimensions.clone()];
        }

        self.dimensions
            .iter()
            .map(|custom| {
                let mut merged = self.default_dimensions.clone();
                merged.extend(custom.iter().map(|(k, v)| (k.clone(), v.clone())));
                merged
            })
            .collect()
    }

    /// Record a metric sample
    ///
    /// Samples recorded under the same name accumulate in order. The
    /// storage resolution is fixed by the first write of a name; a
    /// conflicting resolution on a later write is rejected.
    pub fn put_metric(
        &mut self,
        name: impl Into<String>,
        value: impl Into<f64>,
        unit: Unit,
        storage_resolution: StorageResolution,
    ) -> Result<(), ValidationError> {
        let name = name.into();
        let value = value.into();
        validate::validate_metric(&name, value)?;
        match self.metrics.get_mut(&name) {
            Some(existing) => {
                if existing.storage_resolution != storage_resolution {
                    return Err(ValidationError::InvalidMetric(format!(
                        "resolution for metric {} conflicts with its earlier samples",
                        name
                    )));
                }
                existing.add_value(value);
            }
            None => {
                self.metrics
                    .insert(name, MetricValues::new(value, unit, storage_resolution));
            }
        }
        Ok(())
    }

    /// Replace the timestamp used for every subsequent flush of this
    /// context
    pub fn set_timestamp(
        &mut self,
        timestamp: SystemTime,
    ) -> Result<(), ValidationError> {
        validate::validate_timestamp(timestamp)?;
        self.timestamp = timestamp;
        Ok(())
    }

    /// Create an independently flushable context carrying over namespace,
    /// properties, default dimensions, and timestamp
    ///
    /// The metrics map always starts empty. Custom dimension sets carry
    /// over only when `preserve_dimensions` is set. No mutable state is
    /// shared with the parent, so the copy can be flushed concurrently.
    pub fn create_copy_with_context(
        &self,
        preserve_dimensions: bool,
    ) -> MetricsContext {
        MetricsContext {
            namespace: self.namespace.clone(),
            properties: self.properties.clone(),
            meta: BTreeMap::new(),
            metrics: BTreeMap::new(),
            timestamp: self.timestamp,
            dimensions: if preserve_dimensions {
                self.dimensions.clone()
            } else {
                Vec::new()
            },
            default_dimensions: self.default_dimensions.clone(),
            should_use_default_dimensions: self.should_use_default_dimensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions;
    use std::time::Duration;

    #[test]
    fn default_namespace() {
        assert_eq!(MetricsContext::empty().namespace, DEFAULT_NAMESPACE)
    }

    #[test]
    fn set_namespace_replaces_validated_value() {
        let mut ctx = MetricsContext::empty();
        ctx.set_namespace("checkout").unwrap();
        assert_eq!(ctx.namespace, "checkout");
        assert!(ctx.set_namespace("").is_err());
        assert_eq!(ctx.namespace, "checkout");
    }

    #[test]
    fn metrics_accumulate_in_order() {
        let mut ctx = MetricsContext::empty();
        ctx.put_metric("latency", 1, Unit::None, StorageResolution::Standard)
            .unwrap();
        ctx.put_metric("latency", 2, Unit::None, StorageResolution::Standard)
            .unwrap();
        let values = &ctx.metrics["latency"];
        assert_eq!(values.values, vec![1.0, 2.0]);
        assert_eq!(values.unit, Unit::None);
    }

    #[test]
    fn first_unit_wins_for_a_metric_name() {
        let mut ctx = MetricsContext::empty();
        ctx.put_metric("latency", 1, Unit::Milliseconds, StorageResolution::Standard)
            .unwrap();
        ctx.put_metric("latency", 2, Unit::Seconds, StorageResolution::Standard)
            .unwrap();
        assert_eq!(ctx.metrics["latency"].unit, Unit::Milliseconds);
    }

    #[test]
    fn resolution_conflict_is_rejected() {
        let mut ctx = MetricsContext::empty();
        ctx.put_metric("latency", 1, Unit::Milliseconds, StorageResolution::High)
            .unwrap();
        let err = ctx
            .put_metric("latency", 2, Unit::Milliseconds, StorageResolution::Standard)
            .unwrap_err();
        match err {
            ValidationError::InvalidMetric(_) => {}
            other => panic!("expected InvalidMetric, got {:?}", other),
        }
        // the earlier sample is untouched
        assert_eq!(ctx.metrics["latency"].values, vec![1.0]);
    }

    #[test]
    fn put_dimensions_dedupes_by_key_set() {
        let mut ctx = MetricsContext::empty();
        ctx.put_dimensions(dimensions! { "Service" => "one" })
            .unwrap();
        ctx.put_dimensions(dimensions! { "Region" => "us-east-1" })
            .unwrap();
        ctx.put_dimensions(dimensions! { "Service" => "two" })
            .unwrap();

        let sets = ctx.get_dimensions();
        assert_eq!(sets.len(), 2);
        // the re-put key set moved to the tail with its latest value
        assert_eq!(sets[0], dimensions! { "Region" => "us-east-1" });
        assert_eq!(sets[1], dimensions! { "Service" => "two" });
    }

    #[test]
    fn dedup_considers_keys_not_values() {
        let mut ctx = MetricsContext::empty();
        ctx.put_dimensions(dimensions! { "Service" => "one", "Region" => "us-east-1" })
            .unwrap();
        ctx.put_dimensions(dimensions! { "Service" => "two", "Region" => "eu-west-1" })
            .unwrap();
        assert_eq!(
            ctx.get_dimensions(),
            vec![dimensions! { "Service" => "two", "Region" => "eu-west-1" }]
        );
    }

    #[test]
    fn default_dimensions_returned_when_no_custom_sets() {
        let mut ctx = MetricsContext::empty();
        ctx.set_default_dimensions(dimensions! { "ServiceName" => "demo" });
        assert_eq!(
            ctx.get_dimensions(),
            vec![dimensions! { "ServiceName" => "demo" }]
        );
    }

    #[test]
    fn custom_sets_merge_over_defaults() {
        let mut ctx = MetricsContext::empty();
        ctx.set_default_dimensions(dimensions! { "ServiceName" => "demo" });
        ctx.put_dimensions(dimensions! { "Operation" => "publish" })
            .unwrap();
        assert_eq!(
            ctx.get_dimensions(),
            vec![dimensions! { "ServiceName" => "demo", "Operation" => "publish" }]
        );
    }

    #[test]
    fn custom_keys_win_over_defaults_on_conflict() {
        let mut ctx = MetricsContext::empty();
        ctx.set_default_dimensions(dimensions! { "ServiceName" => "detected" });
        ctx.put_dimensions(dimensions! { "ServiceName" => "override" })
            .unwrap();
        assert_eq!(
            ctx.get_dimensions(),
            vec![dimensions! { "ServiceName" => "override" }]
        );
    }

    #[test]
    fn set_dimensions_disables_default_merge() {
        let mut ctx = MetricsContext::empty();
        ctx.set_default_dimensions(dimensions! { "ServiceName" => "demo" });
        ctx.set_dimensions(vec![dimensions! { "Operation" => "publish" }], false)
            .unwrap();
        assert_eq!(
            ctx.get_dimensions(),
            vec![dimensions! { "Operation" => "publish" }]
        );
    }

    #[test]
    fn reset_dimensions_clears_custom_sets() {
        let mut ctx = MetricsContext::empty();
        ctx.set_default_dimensions(dimensions! { "ServiceName" => "demo" });
        ctx.put_dimensions(dimensions! { "Operation" => "publish" })
            .unwrap();
        ctx.reset_dimensions(true);
        assert_eq!(
            ctx.get_dimensions(),
            vec![dimensions! { "ServiceName" => "demo" }]
        );

        ctx.reset_dimensions(false);
        assert!(ctx.get_dimensions().is_empty());
    }

    #[test]
    fn invalid_dimension_set_leaves_state_unchanged() {
        let mut ctx = MetricsContext::empty();
        ctx.put_dimensions(dimensions! { "Service" => "one" })
            .unwrap();
        assert!(ctx.put_dimensions(dimensions! { ":bad" => "value" }).is_err());
        assert_eq!(ctx.get_dimensions().len(), 1);
    }

    #[test]
    fn set_property_overwrites() {
        let mut ctx = MetricsContext::empty();
        ctx.set_property("RequestId", "first");
        ctx.set_property("RequestId", "second");
        assert_eq!(ctx.properties["RequestId"], "second");
    }

    #[test]
    fn set_timestamp_validates_the_window() {
        let mut ctx = MetricsContext::empty();
        let recent = SystemTime::now() - Duration::from_secs(60);
        ctx.set_timestamp(recent).unwrap();
        assert_eq!(ctx.timestamp, recent);

        let too_far = SystemTime::now() + Duration::from_secs(3 * 60 * 60);
        assert!(ctx.set_timestamp(too_far).is_err());
        assert_eq!(ctx.timestamp, recent);
    }

    #[test]
    fn copy_shares_identity_but_not_metrics() {
        let mut ctx = MetricsContext::empty();
        ctx.set_namespace("checkout").unwrap();
        ctx.set_property("RequestId", "abc");
        ctx.set_default_dimensions(dimensions! { "ServiceName" => "demo" });
        ctx.put_dimensions(dimensions! { "Operation" => "publish" })
            .unwrap();
        ctx.put_metric("latency", 1, Unit::Milliseconds, StorageResolution::Standard)
            .unwrap();

        let copy = ctx.create_copy_with_context(true);
        assert_eq!(copy.namespace, "checkout");
        assert_eq!(copy.properties["RequestId"], "abc");
        assert!(copy.metrics.is_empty());
        assert_eq!(copy.get_dimensions(), ctx.get_dimensions());
        assert_eq!(copy.timestamp, ctx.timestamp);

        let bare = ctx.create_copy_with_context(false);
        assert_eq!(
            bare.get_dimensions(),
            vec![dimensions! { "ServiceName" => "demo" }]
        );
    }
}
