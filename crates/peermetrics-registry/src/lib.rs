//! peermetrics-registry — the metrics layer of peermetrics.
//!
//! Instruments accumulate values in-process, registries group them and
//! produce serializable snapshots, and [`aggregate`] merges snapshot lists
//! gathered from several processes into one exposition.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── register() ← Counter / Gauge / Histogram
//!   ├── snapshots() → Vec<MetricFamily>   (collect hooks run first)
//!   └── render() → Prometheus text
//!
//! aggregate(&[Vec<MetricFamily>]) → AggregatedRegistry
//!   └── per-series Aggregator (sum, first, min, max, average, omit)
//! ```

pub mod aggregate;
pub mod error;
pub mod instrument;
pub mod prometheus;
pub mod registry;
pub mod snapshot;

pub use aggregate::{AggregatedRegistry, aggregate};
pub use error::{RegistryError, RegistryResult};
pub use instrument::{Counter, Gauge, Histogram, Instrument};
pub use prometheus::render_prometheus;
pub use registry::Registry;
pub use snapshot::{Aggregator, Labels, MetricFamily, MetricKind, Sample, labels};
