//! peermetrics.toml configuration parser.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use peermetrics_cluster::{MemoryHub, PeerIndex, Transport, TransportError};

use crate::error::{MetricsError, MetricsResult};

pub use peermetrics_cluster::ClusterConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerMetricsConfig {
    pub cluster: ClusterConfig,
    pub transport: TransportConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix stream sockets shared through a directory.
    #[default]
    Unix,
    /// In-process only; the worker never sees peers.
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub socket_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9464".to_string(),
        }
    }
}

impl PeerMetricsConfig {
    pub fn from_file(path: &Path) -> MetricsResult<Self> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    pub fn to_toml_string(&self) -> MetricsResult<String> {
        toml::to_string_pretty(self).map_err(|e| MetricsError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> MetricsResult<()> {
        self.cluster.validate()?;
        if self.http.listen.trim().is_empty() {
            return Err(MetricsError::InvalidConfig("http.listen is empty".to_string()));
        }
        Ok(())
    }
}

impl std::str::FromStr for PeerMetricsConfig {
    type Err = MetricsError;

    fn from_str(s: &str) -> MetricsResult<Self> {
        let config: PeerMetricsConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl TransportConfig {
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("peermetrics"))
    }

    /// Open the configured transport for `topic` as peer `index`.
    pub fn connect(&self, topic: &str, index: PeerIndex) -> Result<Arc<dyn Transport>, TransportError> {
        match self.kind {
            #[cfg(unix)]
            TransportKind::Unix => Ok(Arc::new(peermetrics_cluster::UnixTransport::bind(
                &self.socket_dir(),
                topic,
                index,
            )?)),
            #[cfg(not(unix))]
            TransportKind::Unix => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix transport is not available on this platform",
            ))),
            TransportKind::Memory => Ok(Arc::new(MemoryHub::new(topic).connect())),
        }
    }
}
