//! Instruments every hub registers on its own.

use std::sync::Weak;

use parking_lot::RwLock;

use peermetrics_registry::{Aggregator, Gauge};

use crate::hub::HubState;

pub const CURRENT_CLUSTER: &str = "current_cluster";
pub const CLUSTER_TOTAL: &str = "cluster_total";

/// This process's peer index. Local scope.
pub(crate) fn current_cluster(state: Weak<RwLock<HubState>>) -> Gauge {
    Gauge::new(CURRENT_CLUSTER, "Peer index of this process")
        .with_aggregator(Aggregator::First)
        .with_collect(move |gauge| {
            if let Some(state) = state.upgrade() {
                gauge.set(f64::from(state.read().index));
            }
        })
}

/// Alive processes in the pool. Aggregated scope, merged with min so a
/// peer that has not yet seen everyone pulls the total down.
pub(crate) fn cluster_total(state: Weak<RwLock<HubState>>) -> Gauge {
    Gauge::new(CLUSTER_TOTAL, "Alive processes in the pool")
        .with_aggregator(Aggregator::Min)
        .with_collect(move |gauge| {
            let count = state
                .upgrade()
                .and_then(|state| state.read().cluster.clone())
                .map_or(0, |cluster| cluster.count());
            gauge.set(count as f64);
        })
}
