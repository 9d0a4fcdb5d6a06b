//! MetricsHub — the per-process entry point.
//!
//! A hub owns the [`RegistrySet`] and, once initialised with clustering
//! enabled, the [`Cluster`] handle. Re-initialising replaces the handle
//! and disposes the old one.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use peermetrics_cluster::{Cluster, ClusterConfig, ClusterError, PeerIndex, Transport};
use peermetrics_registry::{Instrument, Registry, RegistryResult};

use crate::builtin;
use crate::config::PeerMetricsConfig;
use crate::error::MetricsResult;
use crate::registry_set::{RegistryScope, RegistrySet};

#[derive(Default)]
pub(crate) struct HubState {
    pub(crate) index: PeerIndex,
    pub(crate) cluster: Option<Cluster>,
}

/// Instruments to register on [`MetricsHub::init`].
#[derive(Default)]
pub struct MetricsInit {
    pub per_node: Vec<Arc<dyn Instrument>>,
    pub aggregated: Vec<Arc<dyn Instrument>>,
}

impl MetricsInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn per_node(mut self, instrument: impl Instrument + 'static) -> Self {
        self.per_node.push(Arc::new(instrument));
        self
    }

    pub fn aggregated(mut self, instrument: impl Instrument + 'static) -> Self {
        self.aggregated.push(Arc::new(instrument));
        self
    }

    /// Register everything into scratch registries, next to the
    /// built-ins, to surface bad or clashing names.
    fn check(&self, cluster_total: &Arc<dyn Instrument>) -> RegistryResult<()> {
        let aggregated = Registry::new();
        aggregated.register_shared(cluster_total.clone())?;
        for instrument in &self.aggregated {
            aggregated.register_shared(instrument.clone())?;
        }
        let per_node = Registry::new();
        for instrument in &self.per_node {
            per_node.register_shared(instrument.clone())?;
        }
        Ok(())
    }
}

pub struct MetricsHub {
    registries: RegistrySet,
    state: Arc<RwLock<HubState>>,
}

impl MetricsHub {
    /// A hub with only the Local built-ins registered. Until [`init`]
    /// runs it serves local metrics only.
    ///
    /// [`init`]: MetricsHub::init
    pub fn new() -> Self {
        let registries = RegistrySet::new();
        let state = Arc::new(RwLock::new(HubState::default()));
        registries
            .register(
                RegistryScope::Local,
                builtin::current_cluster(Arc::downgrade(&state)),
            )
            .expect("a new local registry accepts current_cluster");
        Self { registries, state }
    }

    pub fn registries(&self) -> &RegistrySet {
        &self.registries
    }

    pub fn index(&self) -> PeerIndex {
        self.state.read().index
    }

    pub fn cluster(&self) -> Option<Cluster> {
        self.state.read().cluster.clone()
    }

    /// (Re)initialise the shared registries and, when clustering is
    /// enabled and a transport is given, start the cluster handle.
    /// Must be called from within a tokio runtime.
    ///
    /// An invalid config or a clashing instrument name is reported before
    /// anything is torn down, so a failed call leaves the hub as it was.
    pub fn init(
        &self,
        config: &ClusterConfig,
        transport: Option<Arc<dyn Transport>>,
        init: MetricsInit,
    ) -> MetricsResult<()> {
        config.validate()?;
        let cluster_total: Arc<dyn Instrument> =
            Arc::new(builtin::cluster_total(Arc::downgrade(&self.state)));
        init.check(&cluster_total)?;

        self.dispose();

        let index = config.resolve_index();
        self.state.write().index = index;
        self.registries.set_node(index);
        self.registries
            .register_shared(RegistryScope::Aggregated, cluster_total)?;
        for instrument in init.aggregated {
            self.registries
                .register_shared(RegistryScope::Aggregated, instrument)?;
        }
        for instrument in init.per_node {
            self.registries
                .register_shared(RegistryScope::PerNode, instrument)?;
        }

        let transport = match transport {
            Some(t) if config.enabled => t,
            _ => {
                info!(index, "serving local metrics only");
                return Ok(());
            }
        };

        match Cluster::start(config.clone(), index, transport, self.registries.shared()) {
            Ok(cluster) => {
                self.state.write().cluster = Some(cluster);
                Ok(())
            }
            Err(ClusterError::Transport(e)) => {
                warn!(index, error = %e, "transport unavailable, serving local metrics only");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// [`init`](MetricsHub::init) with the transport described by `config`.
    /// A transport that cannot be opened degrades to single-process mode.
    pub fn init_from_config(
        &self,
        config: &PeerMetricsConfig,
        init: MetricsInit,
    ) -> MetricsResult<()> {
        let cluster = &config.cluster;
        let transport = if cluster.enabled {
            let topic = cluster.topic();
            match config.transport.connect(&topic, cluster.resolve_index()) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(%topic, error = %e, "failed to open transport");
                    None
                }
            }
        } else {
            None
        };
        self.init(cluster, transport, init)
    }

    /// Exposition text for `targets`, or for the whole pool when empty:
    /// the Local scope, a blank line, then the merged shared scopes.
    pub async fn get_metrics(&self, targets: &[PeerIndex]) -> MetricsResult<String> {
        let local = self.registries.local_text();
        let Some(cluster) = self.cluster() else {
            return Ok(format!("{local}\n{}", self.registries.unmerged_text()));
        };
        let merged = cluster.metrics(targets).await?;
        Ok(format!("{local}\n{merged}"))
    }

    /// Dispose the cluster handle, if any, and clear the shared
    /// registries. The Local scope survives.
    pub fn dispose(&self) {
        let cluster = self.state.write().cluster.take();
        if let Some(cluster) = cluster {
            cluster.dispose();
        }
        self.registries.clear_shared();
    }
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MetricsHub {
    fn drop(&mut self) {
        self.dispose();
    }
}
