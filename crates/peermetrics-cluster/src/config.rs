//! Cluster configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::message::PeerIndex;

/// Tunables for the cluster handle. Every field has a default, so an
/// empty `[cluster]` table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// When false the process serves local metrics only.
    pub enabled: bool,
    /// Transport topic shared by the pool. Defaults to `cluster-<parent pid>`.
    pub topic: Option<String>,
    /// Explicit peer index; overrides `instance_env`.
    pub instance: Option<PeerIndex>,
    /// Env var holding the zero-based instance number set by the process manager.
    pub instance_env: String,
    pub request_timeout_ms: u64,
    pub dead_peer_after_ms: u64,
    pub heartbeat_min_ms: u64,
    pub heartbeat_max_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: None,
            instance: None,
            instance_env: "NODE_APP_INSTANCE".to_string(),
            request_timeout_ms: 1_000,
            dead_peer_after_ms: 10_000,
            heartbeat_min_ms: 4_000,
            heartbeat_max_ms: 6_000,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> ClusterResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dead_peer_after_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "dead_peer_after_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_min_ms >= self.heartbeat_max_ms {
            return Err(ClusterError::InvalidConfig(format!(
                "heartbeat window is empty: [{}, {})",
                self.heartbeat_min_ms, self.heartbeat_max_ms
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dead_peer_after(&self) -> Duration {
        Duration::from_millis(self.dead_peer_after_ms)
    }

    /// Half-open `[min, max)` window the next heartbeat delay is drawn from.
    pub fn heartbeat_window(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.heartbeat_min_ms),
            Duration::from_millis(self.heartbeat_max_ms),
        )
    }

    /// Topic shared by every process of the pool.
    pub fn topic(&self) -> String {
        self.topic.clone().unwrap_or_else(default_topic)
    }

    /// This process's peer index: the explicit `instance`, otherwise the
    /// instance number from the environment plus one, otherwise 0.
    pub fn resolve_index(&self) -> PeerIndex {
        if let Some(index) = self.instance {
            return index;
        }
        index_from_instance(std::env::var(&self.instance_env).ok().as_deref())
    }
}

/// Map a zero-based instance number to a peer index. Missing or
/// unparseable values map to 0.
pub fn index_from_instance(raw: Option<&str>) -> PeerIndex {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(|n| (n + 1).clamp(0, PeerIndex::MAX as i64) as PeerIndex)
        .unwrap_or(0)
}

/// Workers spawned by one supervisor share its pid as their parent.
#[cfg(unix)]
fn default_topic() -> String {
    format!("cluster-{}", std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn default_topic() -> String {
    format!("cluster-{}", std::process::id())
}
