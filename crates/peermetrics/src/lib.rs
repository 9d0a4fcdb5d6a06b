//! peermetrics — one Prometheus exposition for a pool of worker processes.
//!
//! Each worker keeps its own instruments in a [`RegistrySet`]. The
//! [`MetricsHub`] owns the cluster handle for the process; on scrape it
//! gathers snapshots from the requested peers, merges them, and prepends
//! the worker's local-only metrics.
//!
//! # Architecture
//!
//! ```text
//! MetricsHub
//!   ├── RegistrySet
//!   │   ├── Local       (never leaves the process)
//!   │   ├── PerNode     (stamped node="<index>", merged as a union)
//!   │   └── Aggregated  (merged with each instrument's aggregator)
//!   ├── Cluster (optional; absent in single-process mode)
//!   └── get_metrics(targets) → local text + "\n" + merged text
//!
//! http::metrics_router(hub)
//!   └── GET /metrics?nodes=1,2
//! ```

pub mod builtin;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod registry_set;

pub use config::{HttpConfig, PeerMetricsConfig, TransportConfig, TransportKind};
pub use error::{MetricsError, MetricsResult};
pub use hub::{MetricsHub, MetricsInit};
pub use registry_set::{RegistryScope, RegistrySet};

pub use peermetrics_cluster::{Cluster, ClusterConfig, PeerIndex};
pub use peermetrics_registry::{Aggregator, Counter, Gauge, Histogram, Instrument, Registry};
