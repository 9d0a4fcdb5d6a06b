//! peermetrics-cluster — cross-process coordination for peermetrics.
//!
//! Sibling worker processes find each other over a broadcast transport,
//! track who is alive from heartbeats, and fetch each other's metric
//! snapshots on demand with a bounded deadline.
//!
//! # Architecture
//!
//! ```text
//! Cluster (one handle per process)
//!   ├── dispatcher task ← Transport::subscribe()
//!   │   ├── keepalive  → MembershipTracker::record_heartbeat()
//!   │   ├── req_metric → answer with local snapshot
//!   │   └── res_metric → PendingTable::deliver()
//!   ├── heartbeat task
//!   │   ├── MembershipTracker::sweep()
//!   │   └── broadcast keepalive, sleep [min, max)
//!   └── fetch_remote() / fetch_by_nodes() / fetch_all() / metrics()
//! ```
//!
//! Dropping the last handle, or calling [`Cluster::dispose`], stops both
//! tasks and closes the transport.

pub mod cluster;
pub mod config;
pub mod error;
pub mod exchange;
pub mod heartbeat;
pub mod membership;
pub mod message;
pub mod transport;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::{ClusterError, ClusterResult, TransportError};
pub use membership::{MembershipTracker, NodeChanged, PeerRecord};
pub use message::{Message, PeerIndex};
pub use transport::memory::{MemoryHub, MemoryTransport};
#[cfg(unix)]
pub use transport::unix::UnixTransport;
pub use transport::{Incoming, Transport};
