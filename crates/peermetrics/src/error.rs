//! Error types for the metrics hub.

use thiserror::Error;

use peermetrics_cluster::ClusterError;
use peermetrics_registry::RegistryError;

/// Result type alias for hub operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to read config: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl MetricsError {
    /// Whether a scrape failed because peers did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MetricsError::Cluster(ClusterError::Timeout { .. }))
    }
}
