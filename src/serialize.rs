//! Converts accumulated context state into embedded metric format
//! payloads
//!
//! https://docs.aws.amazon.com/AmazonCloudWatch/latest/monitoring/CloudWatch_Embedded_Metric_Format_Specification.html
use crate::context::{MetricsContext, StorageResolution, Unit};
use serde::Serialize as SerdeSerialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::UNIX_EPOCH;

/// Only the first 9 names of a dimension set are emitted in the
/// `Dimensions` directive. Other sinks or formats can support more, so
/// this is enforced here rather than at storage time.
pub(crate) const MAX_DIMENSIONS: usize = 9;
pub(crate) const MAX_METRICS_PER_EVENT: usize = 100;
pub(crate) const MAX_VALUES_PER_METRIC: usize = 100;

#[derive(SerdeSerialize)]
struct MetricDefinition<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Unit")]
    unit: Unit,
    #[serde(rename = "StorageResolution", skip_serializing_if = "Option::is_none")]
    storage_resolution: Option<u32>,
}

#[derive(SerdeSerialize)]
struct MetricDirective<'a> {
    #[serde(rename = "Namespace")]
    namespace: &'a str,
    #[serde(rename = "Dimensions")]
    dimensions: &'a [Vec<&'a str>],
    #[serde(rename = "Metrics")]
    metrics: Vec<MetricDefinition<'a>>,
}

#[derive(SerdeSerialize)]
struct Metadata<'a> {
    #[serde(rename = "Timestamp")]
    timestamp: u64,
    #[serde(flatten)]
    meta: &'a BTreeMap<String, Value>,
    #[serde(rename = "CloudWatchMetrics")]
    cloud_watch_metrics: [MetricDirective<'a>; 1],
}

#[derive(SerdeSerialize)]
struct Payload<'a> {
    _aws: Metadata<'a>,
    #[serde(flatten)]
    target_values: BTreeMap<&'a str, Value>,
}

/// A metric with samples still waiting to be packed into a payload
///
/// Ordered by remaining sample count so the max-heap always yields the
/// metric with the most samples left. Ties break on name to keep the
/// packing deterministic.
#[derive(PartialEq, Eq)]
struct PendingMetric<'a> {
    remaining: usize,
    offset: usize,
    name: &'a str,
}

impl Ord for PendingMetric<'_> {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        self.remaining
            .cmp(&other.remaining)
            .then_with(|| other.name.cmp(self.name))
    }
}

impl PartialOrd for PendingMetric<'_> {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub trait Serialize {
    fn serialize(
        &self,
        context: &MetricsContext,
    ) -> Vec<String>;
}

/// Serializes a context into one or more newline-free JSON events for
/// CloudWatch Logs with embedded metric directives
///
/// Each event holds at most [MAX_METRICS_PER_EVENT] metric definitions
/// and at most [MAX_VALUES_PER_METRIC] samples per definition. Metrics
/// with more samples are split across events under the same name, slices
/// contiguous and in recording order. Events are packed
/// largest-remaining-first so the value capacity of each event fills
/// efficiently.
pub struct LogSerializer;

impl Serialize for LogSerializer {
    fn serialize(
        &self,
        context: &MetricsContext,
    ) -> Vec<String> {
        let dimension_sets = context.get_dimensions();
        let (dimension_keys, dimension_values) = dimension_sets.iter().fold(
            (Vec::new(), BTreeMap::new()),
            |(mut keys, mut values), set| {
                keys.push(
                    set.keys()
                        .take(MAX_DIMENSIONS)
                        .map(String::as_str)
                        .collect::<Vec<&str>>(),
                );
                for (key, value) in set {
                    values.insert(key.as_str(), Value::from(value.as_str()));
                }
                (keys, values)
            },
        );

        // every payload repeats the dimension values and properties;
        // properties shadow dimension values on key collision
        let mut base_values = dimension_values;
        for (key, value) in &context.properties {
            base_values.insert(key, value.clone());
        }

        let timestamp = context
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let render = |metrics: Vec<MetricDefinition>, values: BTreeMap<&str, Value>| {
            let payload = Payload {
                _aws: Metadata {
                    timestamp,
                    meta: &context.meta,
                    cloud_watch_metrics: [MetricDirective {
                        namespace: &context.namespace,
                        dimensions: &dimension_keys,
                        metrics,
                    }],
                },
                target_values: values,
            };
            serde_json::to_string(&payload).unwrap()
        };

        let mut queue: BinaryHeap<PendingMetric> = context
            .metrics
            .iter()
            .map(|(name, metric)| PendingMetric {
                remaining: metric.values.len(),
                offset: 0,
                name,
            })
            .collect();
        // metrics sliced into the current event wait here rather than
        // re-entering the queue, so no event carries the same name twice
        let mut held_aside: Vec<PendingMetric> = Vec::new();

        let mut batches: Vec<String> = Vec::new();
        let mut current_metrics: Vec<MetricDefinition> = Vec::new();
        let mut current_values = base_values.clone();

        loop {
            match queue.pop() {
                Some(mut pending) => {
                    let metric = &context.metrics[pending.name];
                    let take = pending.remaining.min(MAX_VALUES_PER_METRIC);
                    let slice = &metric.values[pending.offset..pending.offset + take];
                    // a metric with a single sample is unwrapped to make
                    // querying easier
                    let value: Value = if metric.values.len() == 1 {
                        slice[0].into()
                    } else {
                        slice.to_vec().into()
                    };
                    current_values.insert(pending.name, value);
                    current_metrics.push(MetricDefinition {
                        name: pending.name,
                        unit: metric.unit,
                        storage_resolution: match metric.storage_resolution {
                            StorageResolution::High => Some(1),
                            StorageResolution::Standard => None,
                        },
                    });
                    pending.offset += take;
                    pending.remaining -= take;
                    if pending.remaining > 0 {
                        held_aside.push(pending);
                    }
                    if current_metrics.len() == MAX_METRICS_PER_EVENT {
                        batches.push(render(
                            std::mem::replace(&mut current_metrics, Vec::new()),
                            std::mem::replace(&mut current_values, base_values.clone()),
                        ));
                        queue.extend(held_aside.drain(..));
                    }
                }
                None => {
                    if held_aside.is_empty() {
                        break;
                    }
                    batches.push(render(
                        std::mem::replace(&mut current_metrics, Vec::new()),
                        std::mem::replace(&mut current_values, base_values.clone()),
                    ));
                    queue.extend(held_aside.drain(..));
                }
            }
        }

        // a context with no metrics still emits a single payload carrying
        // its dimensions, properties, and namespace
        if batches.is_empty() || !current_metrics.is_empty() {
            batches.push(render(current_metrics, current_values));
        }

        batches
    }
}
