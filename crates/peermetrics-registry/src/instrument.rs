//! Instruments — counters, gauges, and histograms.
//!
//! Each instrument is a cheap `Clone` handle over shared state, so the
//! code that updates it and the registry that snapshots it hold the same
//! values. Updates take a short `parking_lot` lock and never await.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::snapshot::{Aggregator, Labels, MetricFamily, MetricKind, Sample};

/// Default histogram buckets (seconds).
pub const DEFAULT_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Common interface the registry needs from an instrument.
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;
    fn help(&self) -> &str;
    fn kind(&self) -> MetricKind;
    fn aggregator(&self) -> Aggregator;

    /// Refresh the instrument before a snapshot. Most instruments have
    /// nothing to do here.
    fn collect(&self) {}

    /// Read the current values.
    fn snapshot(&self) -> MetricFamily;

    /// Drop all recorded values.
    fn reset(&self);
}

#[derive(Debug, Clone)]
struct Meta {
    name: String,
    help: String,
    aggregator: Aggregator,
}

impl Meta {
    fn new(name: &str, help: &str) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            aggregator: Aggregator::Sum,
        }
    }

    fn family(&self, kind: MetricKind, samples: Vec<Sample>) -> MetricFamily {
        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind,
            aggregator: self.aggregator,
            samples,
        }
    }
}

/// Snapshot a label → value map. An instrument that was never touched
/// still reports a single zero series.
fn scalar_samples(values: &BTreeMap<Labels, f64>) -> Vec<Sample> {
    if values.is_empty() {
        return vec![Sample::new(Labels::new(), 0.0)];
    }
    values
        .iter()
        .map(|(labels, value)| Sample::new(labels.clone(), *value))
        .collect()
}

// ── Counter ────────────────────────────────────────────────────────

/// Monotonically increasing value.
#[derive(Clone)]
pub struct Counter {
    meta: Arc<Meta>,
    values: Arc<Mutex<BTreeMap<Labels, f64>>>,
}

impl Counter {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            meta: Arc::new(Meta::new(name, help)),
            values: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Set the cross-process aggregator (default: sum).
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        Arc::make_mut(&mut self.meta).aggregator = aggregator;
        self
    }

    pub fn inc(&self) {
        self.inc_with(&Labels::new(), 1.0);
    }

    pub fn inc_by(&self, amount: f64) {
        self.inc_with(&Labels::new(), amount);
    }

    /// Increment the series identified by `labels`. Negative amounts are
    /// rejected.
    pub fn inc_with(&self, labels: &Labels, amount: f64) {
        if amount < 0.0 {
            warn!(counter = %self.meta.name, amount, "counter cannot decrease");
            return;
        }
        *self.values.lock().entry(labels.clone()).or_insert(0.0) += amount;
    }

    pub fn get(&self, labels: &Labels) -> f64 {
        self.values.lock().get(labels).copied().unwrap_or(0.0)
    }
}

impl Instrument for Counter {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn help(&self) -> &str {
        &self.meta.help
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Counter
    }

    fn aggregator(&self) -> Aggregator {
        self.meta.aggregator
    }

    fn snapshot(&self) -> MetricFamily {
        let values = self.values.lock();
        self.meta.family(MetricKind::Counter, scalar_samples(&values))
    }

    fn reset(&self) {
        self.values.lock().clear();
    }
}

// ── Gauge ──────────────────────────────────────────────────────────

type CollectHook = Arc<dyn Fn(&Gauge) + Send + Sync>;

/// Value that can go up and down, optionally refreshed by a collect hook
/// right before every snapshot.
#[derive(Clone)]
pub struct Gauge {
    meta: Arc<Meta>,
    values: Arc<Mutex<BTreeMap<Labels, f64>>>,
    on_collect: Option<CollectHook>,
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gauge")
            .field("name", &self.meta.name)
            .field("aggregator", &self.meta.aggregator)
            .finish_non_exhaustive()
    }
}

impl Gauge {
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            meta: Arc::new(Meta::new(name, help)),
            values: Arc::new(Mutex::new(BTreeMap::new())),
            on_collect: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        Arc::make_mut(&mut self.meta).aggregator = aggregator;
        self
    }

    /// Install a hook that runs on every `collect()`.
    pub fn with_collect(mut self, hook: impl Fn(&Gauge) + Send + Sync + 'static) -> Self {
        self.on_collect = Some(Arc::new(hook));
        self
    }

    pub fn set(&self, value: f64) {
        self.set_with(&Labels::new(), value);
    }

    pub fn set_with(&self, labels: &Labels, value: f64) {
        self.values.lock().insert(labels.clone(), value);
    }

    pub fn add(&self, labels: &Labels, delta: f64) {
        *self.values.lock().entry(labels.clone()).or_insert(0.0) += delta;
    }

    pub fn inc(&self) {
        self.add(&Labels::new(), 1.0);
    }

    pub fn dec(&self) {
        self.add(&Labels::new(), -1.0);
    }

    pub fn get(&self, labels: &Labels) -> f64 {
        self.values.lock().get(labels).copied().unwrap_or(0.0)
    }
}

impl Instrument for Gauge {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn help(&self) -> &str {
        &self.meta.help
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Gauge
    }

    fn aggregator(&self) -> Aggregator {
        self.meta.aggregator
    }

    fn collect(&self) {
        if let Some(hook) = &self.on_collect {
            hook(self);
        }
    }

    fn snapshot(&self) -> MetricFamily {
        let values = self.values.lock();
        self.meta.family(MetricKind::Gauge, scalar_samples(&values))
    }

    fn reset(&self) {
        self.values.lock().clear();
    }
}

// ── Histogram ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct HistogramSeries {
    /// Non-cumulative per-bucket counts, one per upper bound.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

/// Observations bucketed by upper bound.
#[derive(Clone)]
pub struct Histogram {
    meta: Arc<Meta>,
    buckets: Arc<[f64]>,
    series: Arc<Mutex<BTreeMap<Labels, HistogramSeries>>>,
}

impl Histogram {
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(name, help, DEFAULT_BUCKETS)
    }

    /// Create a histogram with custom upper bounds. Bounds are sorted and
    /// deduplicated; `+Inf` is implicit.
    pub fn with_buckets(name: &str, help: &str, buckets: &[f64]) -> Self {
        let mut bounds: Vec<f64> = buckets.iter().copied().filter(|b| b.is_finite()).collect();
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        Self {
            meta: Arc::new(Meta::new(name, help)),
            buckets: bounds.into(),
            series: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        Arc::make_mut(&mut self.meta).aggregator = aggregator;
        self
    }

    pub fn observe(&self, value: f64) {
        self.observe_with(&Labels::new(), value);
    }

    pub fn observe_with(&self, labels: &Labels, value: f64) {
        let mut series = self.series.lock();
        let entry = series
            .entry(labels.clone())
            .or_insert_with(|| HistogramSeries {
                counts: vec![0; self.buckets.len()],
                ..Default::default()
            });
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            entry.counts[i] += 1;
        }
        entry.sum += value;
        entry.count += 1;
    }

    fn series_samples(&self, labels: &Labels, series: &HistogramSeries) -> Vec<Sample> {
        let bucket_name = format!("{}_bucket", self.meta.name);
        let mut samples = Vec::with_capacity(self.buckets.len() + 3);
        let mut cumulative = 0u64;
        for (bound, count) in self.buckets.iter().zip(series.counts.iter()) {
            cumulative += count;
            let mut le = labels.clone();
            le.insert("le".to_string(), bound.to_string());
            samples.push(Sample {
                metric_name: Some(bucket_name.clone()),
                labels: le,
                value: cumulative as f64,
            });
        }
        let mut inf = labels.clone();
        inf.insert("le".to_string(), "+Inf".to_string());
        samples.push(Sample {
            metric_name: Some(bucket_name),
            labels: inf,
            value: series.count as f64,
        });
        samples.push(Sample {
            metric_name: Some(format!("{}_sum", self.meta.name)),
            labels: labels.clone(),
            value: series.sum,
        });
        samples.push(Sample {
            metric_name: Some(format!("{}_count", self.meta.name)),
            labels: labels.clone(),
            value: series.count as f64,
        });
        samples
    }
}

impl Instrument for Histogram {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn help(&self) -> &str {
        &self.meta.help
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Histogram
    }

    fn aggregator(&self) -> Aggregator {
        self.meta.aggregator
    }

    fn snapshot(&self) -> MetricFamily {
        let series = self.series.lock();
        let samples = if series.is_empty() {
            let empty = HistogramSeries {
                counts: vec![0; self.buckets.len()],
                ..Default::default()
            };
            self.series_samples(&Labels::new(), &empty)
        } else {
            series
                .iter()
                .flat_map(|(labels, s)| self.series_samples(labels, s))
                .collect()
        };
        self.meta.family(MetricKind::Histogram, samples)
    }

    fn reset(&self) {
        self.series.lock().clear();
    }
}
