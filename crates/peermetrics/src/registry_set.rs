//! RegistrySet — instruments partitioned by merge scope.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use peermetrics_registry::{Instrument, Registry, RegistryResult, labels};

use crate::PeerIndex;

/// How a registry's instruments are treated when peers are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryScope {
    /// Meaningful only to this process; never sent to peers.
    Local,
    /// Every series carries `node="<index>"`, so peers never collide and
    /// the merge is a plain union.
    PerNode,
    /// Merged numerically with each instrument's aggregator.
    Aggregated,
}

/// The three registries of one process.
#[derive(Clone, Default)]
pub struct RegistrySet {
    local: Registry,
    per_node: Registry,
    aggregated: Registry,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self, scope: RegistryScope) -> &Registry {
        match scope {
            RegistryScope::Local => &self.local,
            RegistryScope::PerNode => &self.per_node,
            RegistryScope::Aggregated => &self.aggregated,
        }
    }

    pub fn register(
        &self,
        scope: RegistryScope,
        instrument: impl Instrument + 'static,
    ) -> RegistryResult<()> {
        self.registry(scope).register(instrument)
    }

    pub fn register_shared(
        &self,
        scope: RegistryScope,
        instrument: Arc<dyn Instrument>,
    ) -> RegistryResult<()> {
        self.registry(scope).register_shared(instrument)
    }

    /// Stamp the per-node registry with this process's index.
    pub fn set_node(&self, index: PeerIndex) {
        self.per_node
            .set_default_labels(labels(&[("node", &index.to_string())]));
    }

    /// Registries shared with peers, in collection order.
    pub fn shared(&self) -> Vec<Registry> {
        vec![self.aggregated.clone(), self.per_node.clone()]
    }

    /// Exposition of the Local scope.
    pub fn local_text(&self) -> String {
        self.local.render()
    }

    /// Exposition of this process's shared registries, without any merge.
    pub fn unmerged_text(&self) -> String {
        self.shared().iter().map(Registry::render).collect()
    }

    pub fn clear_shared(&self) {
        self.aggregated.clear();
        self.per_node.clear();
    }
}
