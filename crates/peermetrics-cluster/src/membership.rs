//! Membership tracker — which peers are alive.
//!
//! Every keepalive refreshes a peer's last-seen time; a periodic sweep
//! evicts peers that have been silent longer than the dead-peer
//! threshold. The local process is implicit and never stored. Times are
//! monotonic, so wall-clock steps neither freeze nor force evictions.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::message::PeerIndex;

/// Membership change, for logging and observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeChanged {
    pub added: Vec<PeerIndex>,
    pub removed: Vec<PeerIndex>,
}

/// One known live peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub index: PeerIndex,
    pub last_seen: Instant,
}

/// Tracks known peers and when they were last heard from.
#[derive(Debug)]
pub struct MembershipTracker {
    self_index: PeerIndex,
    dead_after: Duration,
    peers: BTreeMap<PeerIndex, Instant>,
}

impl MembershipTracker {
    pub fn new(self_index: PeerIndex, dead_after: Duration) -> Self {
        Self {
            self_index,
            dead_after,
            peers: BTreeMap::new(),
        }
    }

    pub fn self_index(&self) -> PeerIndex {
        self.self_index
    }

    /// Record a keepalive from `peer`. Returns a change event the first
    /// time a peer is seen.
    pub fn record_heartbeat(&mut self, peer: PeerIndex) -> Option<NodeChanged> {
        self.record_heartbeat_at(peer, Instant::now())
    }

    pub fn record_heartbeat_at(&mut self, peer: PeerIndex, now: Instant) -> Option<NodeChanged> {
        if peer == self.self_index {
            return None;
        }
        let is_new = self.peers.insert(peer, now).is_none();
        if is_new {
            debug!(index = self.self_index, %peer, "discovered peer");
            return Some(NodeChanged {
                added: vec![peer],
                removed: Vec::new(),
            });
        }
        None
    }

    /// Evict every peer silent for longer than the threshold.
    pub fn sweep(&mut self) -> Option<NodeChanged> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&mut self, now: Instant) -> Option<NodeChanged> {
        let dead: Vec<PeerIndex> = self
            .peers
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.dead_after)
            .map(|(index, _)| *index)
            .collect();
        if dead.is_empty() {
            return None;
        }
        for index in &dead {
            self.peers.remove(index);
        }
        Some(NodeChanged {
            added: Vec::new(),
            removed: dead,
        })
    }

    /// Known peers plus this process.
    pub fn alive_count(&self) -> usize {
        self.peers.len() + 1
    }

    /// Number of known peers, excluding this process.
    pub fn known_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_known(&self, peer: PeerIndex) -> bool {
        self.peers.contains_key(&peer)
    }

    /// How many distinct entries of `targets` are currently known peers.
    pub fn known_among(&self, targets: &[PeerIndex]) -> usize {
        targets
            .iter()
            .filter(|t| self.peers.contains_key(t))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Known peer indices in ascending order.
    pub fn known_peers(&self) -> Vec<PeerIndex> {
        self.peers.keys().copied().collect()
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .map(|(index, seen)| PeerRecord {
                index: *index,
                last_seen: *seen,
            })
            .collect()
    }
}
