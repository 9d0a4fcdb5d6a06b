//! Request/response correlation for metric fetches.
//!
//! A fetch opens a [`PendingRequest`] under a fresh correlation id before
//! the request leaves the process, so no response can arrive unobserved.
//! The dispatcher hands each matching response to [`PendingTable::deliver`].
//! A pending request resolves exactly once: with all expected snapshots,
//! or with [`ClusterError::Timeout`] at the deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use peermetrics_registry::MetricFamily;

use crate::error::{ClusterError, ClusterResult};
use crate::message::PeerIndex;

/// Generates `CMD_<index>_<sequence>_<nonce>` ids. The sequence keeps ids
/// unique within a process; the random nonce separates restarts and
/// processes that share an index.
#[derive(Debug)]
pub struct CorrelationIds {
    index: PeerIndex,
    seq: AtomicU64,
}

impl CorrelationIds {
    pub fn new(index: PeerIndex) -> Self {
        Self {
            index,
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nonce: u64 = rand::random();
        format!("CMD_{}_{}_{:016x}", self.index, seq, nonce)
    }
}

type Responder = mpsc::UnboundedSender<Vec<MetricFamily>>;

/// Open requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    open: Mutex<HashMap<String, Responder>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request expecting `expected` responses.
    pub fn open(&self, id: &str, expected: usize) -> PendingRequest<'_> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.open.lock().insert(id.to_string(), tx);
        PendingRequest {
            id: id.to_string(),
            expected,
            collected: Vec::new(),
            rx,
            table: self,
        }
    }

    /// Route a response to its request. Returns false for unknown or
    /// already resolved ids.
    pub fn deliver(&self, id: &str, metrics: Vec<MetricFamily>) -> bool {
        match self.open.lock().get(id) {
            Some(tx) => tx.send(metrics).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self, id: &str) {
        self.open.lock().remove(id);
    }
}

/// One in-flight fetch. Dropping it unregisters the correlation id, so
/// late responses are ignored.
#[derive(Debug)]
pub struct PendingRequest<'a> {
    id: String,
    expected: usize,
    collected: Vec<Vec<MetricFamily>>,
    rx: mpsc::UnboundedReceiver<Vec<MetricFamily>>,
    table: &'a PendingTable,
}

impl PendingRequest<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for all expected responses, in arrival order.
    pub async fn wait(mut self, timeout: Duration) -> ClusterResult<Vec<Vec<MetricFamily>>> {
        let expected = self.expected;
        let collected = &mut self.collected;
        let rx = &mut self.rx;

        let complete = tokio::time::timeout(timeout, async {
            while collected.len() < expected {
                match rx.recv().await {
                    Some(metrics) => collected.push(metrics),
                    None => break,
                }
            }
        })
        .await;

        match complete {
            Ok(()) if self.collected.len() >= expected => {
                debug!(id = %self.id, responses = self.collected.len(), "metrics request complete");
                Ok(std::mem::take(&mut self.collected))
            }
            _ => Err(ClusterError::Timeout {
                id: self.id.clone(),
                expected,
                received: self.collected.len(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.table.close(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peermetrics_registry::{Aggregator, Labels, MetricKind, Sample};

    fn snapshot(value: f64) -> Vec<MetricFamily> {
        vec![MetricFamily {
            name: "m".to_string(),
            help: "m".to_string(),
            kind: MetricKind::Gauge,
            aggregator: Aggregator::First,
            samples: vec![Sample::new(Labels::new(), value)],
        }]
    }

    #[test]
    fn ids_are_unique_and_carry_index() {
        let ids = CorrelationIds::new(3);
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("CMD_3_0_"));
        assert!(b.starts_with("CMD_3_1_"));
    }

    #[tokio::test]
    async fn resolves_when_expected_count_reached() {
        let table = PendingTable::new();
        let pending = table.open("req", 2);
        assert!(table.deliver("req", snapshot(1.0)));
        assert!(table.deliver("req", snapshot(2.0)));

        let result = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, vec![snapshot(1.0), snapshot(2.0)]);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_discards_partial_result() {
        let table = PendingTable::new();
        let pending = table.open("req", 2);
        table.deliver("req", snapshot(1.0));

        let err = pending.wait(Duration::from_millis(1000)).await.unwrap_err();
        match err {
            ClusterError::Timeout {
                expected, received, ..
            } => {
                assert_eq!(expected, 2);
                assert_eq!(received, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(table.is_empty());
        assert!(!table.deliver("req", snapshot(2.0)));
    }

    #[tokio::test]
    async fn interleaved_requests_do_not_mix() {
        let table = PendingTable::new();
        let a = table.open("a", 2);
        let b = table.open("b", 1);

        table.deliver("a", snapshot(1.0));
        table.deliver("b", snapshot(10.0));
        table.deliver("a", snapshot(2.0));

        let (ra, rb) = tokio::join!(
            a.wait(Duration::from_secs(1)),
            b.wait(Duration::from_secs(1))
        );
        assert_eq!(ra.unwrap(), vec![snapshot(1.0), snapshot(2.0)]);
        assert_eq!(rb.unwrap(), vec![snapshot(10.0)]);
    }

    #[test]
    fn unknown_id_not_delivered() {
        let table = PendingTable::new();
        assert!(!table.deliver("nope", snapshot(1.0)));
    }
}
