//! Pure checks applied by the context before it mutates state
//!
//! Bounds follow the CloudWatch metric and dimension limits
//! https://docs.aws.amazon.com/AmazonCloudWatch/latest/APIReference/API_MetricDatum.html
use crate::error::ValidationError;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

pub(crate) const MAX_DIMENSION_SET_SIZE: usize = 30;
pub(crate) const MAX_DIMENSION_NAME_LENGTH: usize = 250;
pub(crate) const MAX_DIMENSION_VALUE_LENGTH: usize = 1024;
pub(crate) const MAX_METRIC_NAME_LENGTH: usize = 1024;
pub(crate) const MAX_NAMESPACE_LENGTH: usize = 256;
pub(crate) const MAX_METRIC_VALUE: f64 = 2.3485425827738332e108;

// CloudWatch rejects datapoints older than two weeks or more than two
// hours ahead of ingestion time
pub(crate) const MAX_TIMESTAMP_PAST_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);
pub(crate) const MAX_TIMESTAMP_FUTURE_AGE: Duration = Duration::from_secs(2 * 60 * 60);

fn is_printable_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x20..0x7f).contains(&b))
}

fn is_namespace_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '#' | ':' | '/' | '-')
}

/// Checks a single dimension set against the wire format constraints
pub(crate) fn validate_dimension_set(
    dimension_set: &BTreeMap<String, String>
) -> Result<(), ValidationError> {
    if dimension_set.len() > MAX_DIMENSION_SET_SIZE {
        return Err(ValidationError::DimensionSetExceeded {
            count: dimension_set.len(),
            limit: MAX_DIMENSION_SET_SIZE,
        });
    }

    for (key, value) in dimension_set {
        if !is_printable_ascii(key) {
            return Err(ValidationError::InvalidDimension(format!(
                "dimension key {} has invalid characters",
                key
            )));
        }
        if !is_printable_ascii(value) {
            return Err(ValidationError::InvalidDimension(format!(
                "dimension value {} has invalid characters",
                value
            )));
        }
        if key.trim().is_empty() {
            return Err(ValidationError::InvalidDimension(
                "dimension key must include at least one non-whitespace character".into(),
            ));
        }
        if value.trim().is_empty() {
            return Err(ValidationError::InvalidDimension(format!(
                "dimension value for key {} must include at least one non-whitespace character",
                key
            )));
        }
        if key.len() > MAX_DIMENSION_NAME_LENGTH {
            return Err(ValidationError::InvalidDimension(format!(
                "dimension key {} exceeds maximum length {}",
                key, MAX_DIMENSION_NAME_LENGTH
            )));
        }
        if value.len() > MAX_DIMENSION_VALUE_LENGTH {
            return Err(ValidationError::InvalidDimension(format!(
                "dimension value for key {} exceeds maximum length {}",
                key, MAX_DIMENSION_VALUE_LENGTH
            )));
        }
        if key.starts_with(':') {
            return Err(ValidationError::InvalidDimension(format!(
                "dimension key {} cannot start with ':'",
                key
            )));
        }
    }

    Ok(())
}

pub(crate) fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    if namespace.trim().is_empty() {
        return Err(ValidationError::InvalidNamespace(
            "namespace must include at least one non-whitespace character".into(),
        ));
    }
    if namespace.len() > MAX_NAMESPACE_LENGTH {
        return Err(ValidationError::InvalidNamespace(format!(
            "namespace {} exceeds maximum length {}",
            namespace, MAX_NAMESPACE_LENGTH
        )));
    }
    if !namespace.chars().all(is_namespace_char) {
        return Err(ValidationError::InvalidNamespace(format!(
            "namespace {} has invalid characters",
            namespace
        )));
    }
    Ok(())
}

pub(crate) fn validate_metric(name: &str, value: f64) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::InvalidMetric(
            "metric name must include at least one non-whitespace character".into(),
        ));
    }
    if name.len() > MAX_METRIC_NAME_LENGTH {
        return Err(ValidationError::InvalidMetric(format!(
            "metric name {} exceeds maximum length {}",
            name, MAX_METRIC_NAME_LENGTH
        )));
    }
    if !value.is_finite() {
        return Err(ValidationError::InvalidMetric(format!(
            "metric {} value must be a finite number",
            name
        )));
    }
    if value.abs() > MAX_METRIC_VALUE {
        return Err(ValidationError::InvalidMetric(format!(
            "metric {} value {} is outside the accepted range",
            name, value
        )));
    }
    Ok(())
}

pub(crate) fn validate_timestamp(timestamp: SystemTime) -> Result<(), ValidationError> {
    let now = SystemTime::now();
    if timestamp < now - MAX_TIMESTAMP_PAST_AGE {
        return Err(ValidationError::InvalidTimestamp(
            "timestamp is more than two weeks in the past".into(),
        ));
    }
    if timestamp > now + MAX_TIMESTAMP_FUTURE_AGE {
        return Err(ValidationError::InvalidTimestamp(
            "timestamp is more than two hours in the future".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn accepts_well_formed_dimension_set() {
        let set = btreemap! {
            "Service".to_string() => "Aggregator".to_string(),
            "Region".to_string() => "us-west-2".to_string()
        };
        assert!(validate_dimension_set(&set).is_ok());
    }

    #[test]
    fn rejects_oversized_dimension_set() {
        let set = (0..31)
            .map(|i| (format!("Dimension{}", i), "value".to_string()))
            .collect();
        assert_eq!(
            validate_dimension_set(&set),
            Err(ValidationError::DimensionSetExceeded {
                count: 31,
                limit: MAX_DIMENSION_SET_SIZE
            })
        );
    }

    #[test]
    fn rejects_non_ascii_dimension_value() {
        let set = btreemap! { "Name".to_string() => "مارك".to_string() };
        match validate_dimension_set(&set) {
            Err(ValidationError::InvalidDimension(_)) => {}
            other => panic!("expected InvalidDimension, got {:?}", other),
        }
    }

    #[test]
    fn rejects_blank_dimension_key() {
        let set = btreemap! { "   ".to_string() => "value".to_string() };
        match validate_dimension_set(&set) {
            Err(ValidationError::InvalidDimension(_)) => {}
            other => panic!("expected InvalidDimension, got {:?}", other),
        }
    }

    #[test]
    fn rejects_dimension_key_starting_with_colon() {
        let set = btreemap! { ":Service".to_string() => "value".to_string() };
        match validate_dimension_set(&set) {
            Err(ValidationError::InvalidDimension(_)) => {}
            other => panic!("expected InvalidDimension, got {:?}", other),
        }
    }

    #[test]
    fn rejects_overlong_dimension_value() {
        let set = btreemap! { "Key".to_string() => "v".repeat(1025) };
        match validate_dimension_set(&set) {
            Err(ValidationError::InvalidDimension(_)) => {}
            other => panic!("expected InvalidDimension, got {:?}", other),
        }
    }

    #[test]
    fn rejects_empty_namespace() {
        match validate_namespace("") {
            Err(ValidationError::InvalidNamespace(_)) => {}
            other => panic!("expected InvalidNamespace, got {:?}", other),
        }
    }

    #[test]
    fn rejects_namespace_with_invalid_characters() {
        match validate_namespace("name space") {
            Err(ValidationError::InvalidNamespace(_)) => {}
            other => panic!("expected InvalidNamespace, got {:?}", other),
        }
    }

    #[test]
    fn accepts_namespace_with_allowed_punctuation() {
        assert!(validate_namespace("my-app/checkout_flow#v2:1.0").is_ok());
    }

    #[test]
    fn rejects_overlong_metric_name() {
        match validate_metric(&"m".repeat(1025), 1.0) {
            Err(ValidationError::InvalidMetric(_)) => {}
            other => panic!("expected InvalidMetric, got {:?}", other),
        }
    }

    #[test]
    fn rejects_non_finite_metric_values() {
        for value in &[f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            match validate_metric("latency", *value) {
                Err(ValidationError::InvalidMetric(_)) => {}
                other => panic!("expected InvalidMetric for {}, got {:?}", value, other),
            }
        }
    }

    #[test]
    fn rejects_metric_value_beyond_magnitude_bound() {
        match validate_metric("latency", 1e120) {
            Err(ValidationError::InvalidMetric(_)) => {}
            other => panic!("expected InvalidMetric, got {:?}", other),
        }
        assert!(validate_metric("latency", -1e100).is_ok());
    }

    #[test]
    fn rejects_timestamp_too_far_in_the_future() {
        let timestamp = SystemTime::now() + Duration::from_secs(3 * 60 * 60);
        match validate_timestamp(timestamp) {
            Err(ValidationError::InvalidTimestamp(_)) => {}
            other => panic!("expected InvalidTimestamp, got {:?}", other),
        }
    }

    #[test]
    fn rejects_timestamp_too_far_in_the_past() {
        let timestamp = SystemTime::now() - Duration::from_secs(15 * 24 * 60 * 60);
        match validate_timestamp(timestamp) {
            Err(ValidationError::InvalidTimestamp(_)) => {}
            other => panic!("expected InvalidTimestamp, got {:?}", other),
        }
    }

    #[test]
    fn accepts_recent_timestamp() {
        assert!(validate_timestamp(SystemTime::now()).is_ok());
        assert!(validate_timestamp(SystemTime::now() - Duration::from_secs(60 * 60)).is_ok());
    }
}
