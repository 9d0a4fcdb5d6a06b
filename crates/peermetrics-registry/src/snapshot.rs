//! Snapshot types — the structured, serializable read of a registry.
//!
//! A snapshot is a list of [`MetricFamily`] values. These are what peers
//! exchange over the transport and what [`crate::aggregate`] merges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label set of one time series. Ordered so equal sets compare and hash equal.
pub type Labels = BTreeMap<String, String>;

/// Build a [`Labels`] map from string pairs.
pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Instrument type, as printed on the `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// How values of the same series coming from different processes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    #[default]
    Sum,
    /// The value from the first snapshot in collection order.
    First,
    Min,
    Max,
    Average,
    /// Drop the series from the merged output.
    Omit,
}

impl Aggregator {
    /// Combine `values` (in collection order). `None` means "emit nothing".
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Aggregator::Sum => Some(values.iter().sum()),
            Aggregator::First => values.first().copied(),
            Aggregator::Min => values.iter().copied().reduce(f64::min),
            Aggregator::Max => values.iter().copied().reduce(f64::max),
            Aggregator::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
            Aggregator::Omit => None,
        }
    }
}

/// One value of one time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Series name when it differs from the family name
    /// (`_bucket`, `_sum`, `_count` for histograms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
}

impl Sample {
    pub fn new(labels: Labels, value: f64) -> Self {
        Self {
            metric_name: None,
            labels,
            value,
        }
    }

    /// Name printed on the exposition line for this sample.
    pub fn series_name<'a>(&'a self, family: &'a MetricFamily) -> &'a str {
        self.metric_name.as_deref().unwrap_or(&family.name)
    }
}

/// Point-in-time read of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default)]
    pub aggregator: Aggregator,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    /// Find the value of a series by series name and exact label set.
    pub fn value(&self, series_name: &str, labels: &Labels) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.series_name(self) == series_name && &s.labels == labels)
            .map(|s| s.value)
    }
}
