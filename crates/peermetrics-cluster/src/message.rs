//! Wire messages exchanged between peers.
//!
//! One JSON object per transport frame, tagged by `type`:
//!
//! ```text
//! {"type":"keepalive","id":"…","index":2}
//! {"type":"req_metric","id":"…","index":1,"targets":[2,3]}
//! {"type":"res_metric","id":"…","index":2,"targets":[1],"metrics":[…]}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use peermetrics_registry::MetricFamily;

use crate::error::{ClusterError, ClusterResult};

/// Identifies one process in the pool. Fixed at process start.
pub type PeerIndex = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Presence announcement, broadcast on every heartbeat tick.
    #[serde(rename = "keepalive")]
    Keepalive { id: String, index: PeerIndex },

    /// Ask peers for their snapshots. No `targets` means everyone.
    #[serde(rename = "req_metric")]
    MetricRequest {
        id: String,
        index: PeerIndex,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        targets: Option<Vec<PeerIndex>>,
    },

    /// Answer to a request, addressed to the requester only.
    #[serde(rename = "res_metric")]
    MetricResponse {
        id: String,
        index: PeerIndex,
        targets: Vec<PeerIndex>,
        metrics: Vec<MetricFamily>,
    },
}

impl Message {
    /// Correlation id.
    pub fn id(&self) -> &str {
        match self {
            Message::Keepalive { id, .. }
            | Message::MetricRequest { id, .. }
            | Message::MetricResponse { id, .. } => id,
        }
    }

    /// Index of the peer that sent the message.
    pub fn sender(&self) -> PeerIndex {
        match self {
            Message::Keepalive { index, .. }
            | Message::MetricRequest { index, .. }
            | Message::MetricResponse { index, .. } => *index,
        }
    }

    pub fn targets(&self) -> Option<&[PeerIndex]> {
        match self {
            Message::Keepalive { .. } => None,
            Message::MetricRequest { targets, .. } => targets.as_deref(),
            Message::MetricResponse { targets, .. } => Some(targets),
        }
    }

    /// Whether a peer with `index` should act on this message.
    pub fn is_addressed_to(&self, index: PeerIndex) -> bool {
        self.targets().is_none_or(|t| t.contains(&index))
    }

    pub fn encode(&self) -> ClusterResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ClusterError::Malformed(e.to_string()))
    }

    pub fn decode(frame: &[u8]) -> ClusterResult<Self> {
        serde_json::from_slice(frame).map_err(|e| ClusterError::Malformed(e.to_string()))
    }
}
