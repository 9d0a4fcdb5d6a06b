//! Cluster handle — one per process.
//!
//! Owns the membership tracker, the pending-request table, the transport
//! and the two background tasks (message dispatcher and heartbeat). The
//! handle is `Clone`; background tasks hold only a weak reference, so
//! dropping the last handle disposes the cluster.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peermetrics_registry::{MetricFamily, Registry, aggregate};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::exchange::{CorrelationIds, PendingTable};
use crate::heartbeat::run_heartbeat;
use crate::membership::{MembershipTracker, NodeChanged};
use crate::message::{Message, PeerIndex};
use crate::transport::{Incoming, Transport};

struct ClusterInner {
    index: PeerIndex,
    config: ClusterConfig,
    membership: Mutex<MembershipTracker>,
    pending: PendingTable,
    ids: CorrelationIds,
    transport: Arc<dyn Transport>,
    /// Registries whose snapshots this process contributes to peers.
    registries: Vec<Registry>,
    node_changed: broadcast::Sender<NodeChanged>,
    requests_answered: AtomicU64,
    disposed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to this process's view of the pool.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Subscribe to the transport and start the dispatcher and heartbeat
    /// tasks. Must be called from within a tokio runtime. The first
    /// heartbeat runs after this returns.
    pub fn start(
        config: ClusterConfig,
        index: PeerIndex,
        transport: Arc<dyn Transport>,
        registries: Vec<Registry>,
    ) -> ClusterResult<Self> {
        config.validate()?;
        let incoming = transport.subscribe()?;
        let (shutdown, _) = watch::channel(false);
        let (node_changed, _) = broadcast::channel(64);

        let inner = Arc::new(ClusterInner {
            index,
            membership: Mutex::new(MembershipTracker::new(index, config.dead_peer_after())),
            pending: PendingTable::new(),
            ids: CorrelationIds::new(index),
            transport,
            registries,
            node_changed,
            requests_answered: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            incoming,
            inner.shutdown.subscribe(),
        ));

        let weak = Arc::downgrade(&inner);
        let heartbeat = tokio::spawn(run_heartbeat(
            inner.config.heartbeat_window(),
            move || match weak.upgrade() {
                Some(inner) => {
                    inner.heartbeat_tick();
                    true
                }
                None => false,
            },
            inner.shutdown.subscribe(),
        ));

        inner.tasks.lock().extend([dispatcher, heartbeat]);
        info!(index, topic = %inner.transport.topic(), "cluster started");
        Ok(Self { inner })
    }

    pub fn index(&self) -> PeerIndex {
        self.inner.index
    }

    pub fn topic(&self) -> &str {
        self.inner.transport.topic()
    }

    /// Alive processes, including this one.
    pub fn count(&self) -> usize {
        self.inner.membership.lock().alive_count()
    }

    pub fn known_peers(&self) -> Vec<PeerIndex> {
        self.inner.membership.lock().known_peers()
    }

    /// Membership change events.
    pub fn on_node_changed(&self) -> broadcast::Receiver<NodeChanged> {
        self.inner.node_changed.subscribe()
    }

    /// Metric requests this process has answered.
    pub fn requests_answered(&self) -> u64 {
        self.inner.requests_answered.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// One snapshot list per local registry, collected in-process.
    pub fn local_snapshots(&self) -> Vec<Vec<MetricFamily>> {
        self.inner.local_snapshots()
    }

    /// Fetch snapshots from known peers among `targets` (all known peers
    /// when `None` or empty). Duplicate targets count once. Resolves with
    /// one list per responding peer in arrival order, or fails with
    /// [`ClusterError::Timeout`].
    pub async fn fetch_remote(
        &self,
        targets: Option<&[PeerIndex]>,
    ) -> ClusterResult<Vec<Vec<MetricFamily>>> {
        if self.is_disposed() {
            return Err(ClusterError::Disposed);
        }
        let inner = &self.inner;
        let targets: Option<Vec<PeerIndex>> = targets
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().copied().collect::<BTreeSet<_>>().into_iter().collect());
        let expected = {
            let membership = inner.membership.lock();
            match &targets {
                Some(t) => membership.known_among(t),
                None => membership.known_count(),
            }
        };
        if expected == 0 {
            return Ok(Vec::new());
        }

        let id = inner.ids.next_id();
        // Registered before the request is posted.
        let pending = inner.pending.open(&id, expected);
        let request = Message::MetricRequest {
            id: id.clone(),
            index: inner.index,
            targets,
        };
        if let Err(e) = inner.transport.post(request.encode()?) {
            warn!(index = inner.index, error = %e, "transport unavailable, serving local metrics only");
            return Ok(Vec::new());
        }
        debug!(index = inner.index, %id, expected, "metrics request sent");

        pending.wait(inner.config.request_timeout()).await
    }

    /// Local snapshots followed by those of every known peer.
    pub async fn fetch_all(&self) -> ClusterResult<Vec<Vec<MetricFamily>>> {
        let peers = self.known_peers();
        let mut lists = self.local_snapshots();
        if !peers.is_empty() {
            lists.extend(self.fetch_remote(Some(&peers)).await?);
        }
        Ok(lists)
    }

    /// Snapshots of the listed peers. When this process is listed, its
    /// local snapshots come first.
    pub async fn fetch_by_nodes(
        &self,
        indices: &[PeerIndex],
    ) -> ClusterResult<Vec<Vec<MetricFamily>>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        if !indices.contains(&self.inner.index) {
            return self.fetch_remote(Some(indices)).await;
        }

        let remaining: Vec<PeerIndex> = indices
            .iter()
            .copied()
            .filter(|i| *i != self.inner.index)
            .collect();
        let mut lists = self.local_snapshots();
        if !remaining.is_empty() {
            lists.extend(self.fetch_remote(Some(&remaining)).await?);
        }
        Ok(lists)
    }

    /// Merged exposition for `indices`, or for the whole pool when empty.
    pub async fn metrics(&self, indices: &[PeerIndex]) -> ClusterResult<String> {
        let lists = if indices.is_empty() {
            self.fetch_all().await?
        } else {
            self.fetch_by_nodes(indices).await?
        };
        Ok(aggregate(&lists).render())
    }

    /// Stop background tasks, close the transport and clear the local
    /// registries. Safe to call more than once.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl ClusterInner {
    fn local_snapshots(&self) -> Vec<Vec<MetricFamily>> {
        self.registries.iter().map(Registry::snapshots).collect()
    }

    fn emit(&self, changed: NodeChanged) {
        if !changed.added.is_empty() {
            info!(index = self.index, added = ?changed.added, "peers up");
        }
        if !changed.removed.is_empty() {
            info!(index = self.index, removed = ?changed.removed, "peers down");
        }
        // Nobody listening is fine.
        let _ = self.node_changed.send(changed);
    }

    fn post(&self, message: &Message) {
        let result = message
            .encode()
            .and_then(|frame| self.transport.post(frame).map_err(ClusterError::from));
        if let Err(e) = result {
            warn!(index = self.index, error = %e, "failed to post message");
        }
    }

    fn heartbeat_tick(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let swept = self.membership.lock().sweep();
        if let Some(changed) = swept {
            self.emit(changed);
        }
        debug!(index = self.index, "broadcasting keepalive");
        self.post(&Message::Keepalive {
            id: self.ids.next_id(),
            index: self.index,
        });
    }

    fn handle_frame(&self, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                debug!(index = self.index, error = %e, "dropping malformed frame");
                return;
            }
        };
        if !message.is_addressed_to(self.index) {
            return;
        }

        match message {
            Message::Keepalive { index, .. } => {
                let added = self.membership.lock().record_heartbeat(index);
                if let Some(changed) = added {
                    self.emit(changed);
                }
            }
            Message::MetricRequest { id, index, .. } => self.answer(id, index),
            Message::MetricResponse { id, index, metrics, .. } => {
                if !self.pending.deliver(&id, metrics) {
                    debug!(index = self.index, from = index, %id, "response for unknown request");
                }
            }
        }
    }

    /// Reply to `requester` with this process's merged local snapshot.
    fn answer(&self, id: String, requester: PeerIndex) {
        let metrics = aggregate(&self.local_snapshots()).into_families();
        // Count first: a requester must never hold an uncounted reply.
        self.requests_answered.fetch_add(1, Ordering::Relaxed);
        self.post(&Message::MetricResponse {
            id,
            index: self.index,
            targets: vec![requester],
            metrics,
        });
        debug!(index = self.index, %requester, "answered metrics request");
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.close();
        for registry in &self.registries {
            registry.clear();
        }
        info!(index = self.index, "cluster disposed");
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn dispatch_loop(
    inner: Weak<ClusterInner>,
    mut incoming: Incoming,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = incoming.recv() => {
                let Some(frame) = frame else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_frame(&frame);
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use peermetrics_registry::{Aggregator, Counter, Gauge, Labels, labels};

    use crate::error::TransportError;
    use crate::transport::memory::{MemoryHub, MemoryTransport};

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_min_ms: 20,
            heartbeat_max_ms: 40,
            ..Default::default()
        }
    }

    fn start(hub: &MemoryHub, index: PeerIndex, registries: Vec<Registry>) -> Cluster {
        Cluster::start(fast_config(), index, Arc::new(hub.connect()), registries).unwrap()
    }

    fn counter_registry(value: f64) -> Registry {
        let registry = Registry::new();
        let counter = Counter::new("http_request_total", "requests");
        counter.inc_by(value);
        registry.register(counter).unwrap();
        registry
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    async fn wait_for_peers(cluster: &Cluster, count: usize) {
        wait_until("peers", || cluster.count() >= count).await;
    }

    fn requests(hub: &MemoryHub) -> Vec<Message> {
        hub.posted_messages()
            .into_iter()
            .filter(|m| matches!(m, Message::MetricRequest { .. }))
            .collect()
    }

    /// Announce a peer that never answers metric requests.
    fn mute_peer(hub: &MemoryHub, index: PeerIndex) -> MemoryTransport {
        let mute = hub.connect();
        let keepalive = Message::Keepalive {
            id: format!("k{index}"),
            index,
        };
        mute.post(keepalive.encode().unwrap()).unwrap();
        mute
    }

    /// Delivers injected frames but fails every post.
    struct BrokenTransport {
        inbox: mpsc::UnboundedSender<Bytes>,
        incoming: parking_lot::Mutex<Option<Incoming>>,
    }

    impl BrokenTransport {
        fn new() -> Self {
            let (inbox, incoming) = mpsc::unbounded_channel();
            Self {
                inbox,
                incoming: parking_lot::Mutex::new(Some(incoming)),
            }
        }
    }

    impl Transport for BrokenTransport {
        fn topic(&self) -> &str {
            "broken"
        }

        fn post(&self, _frame: Bytes) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        fn subscribe(&self) -> Result<Incoming, TransportError> {
            self.incoming
                .lock()
                .take()
                .ok_or(TransportError::AlreadySubscribed)
        }

        fn close(&self) {}
    }

    #[tokio::test]
    async fn no_peers_means_no_request() {
        let hub = MemoryHub::new("t");
        let cluster = start(&hub, 1, vec![counter_registry(3.0)]);

        let lists = cluster.fetch_all().await.unwrap();
        assert_eq!(lists.len(), 1);
        assert!(cluster.fetch_remote(None).await.unwrap().is_empty());
        assert!(requests(&hub).is_empty());
        cluster.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn peers_discover_each_other() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![]);
        let b = start(&hub, 2, vec![]);
        let mut events = a.on_node_changed();

        wait_for_peers(&a, 2).await;
        wait_for_peers(&b, 2).await;
        assert_eq!(a.known_peers(), vec![2]);
        assert_eq!(b.known_peers(), vec![1]);

        // Heartbeats keep flowing but the peer is only added once.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut added = 0;
        while let Ok(changed) = events.try_recv() {
            added += changed.added.len();
        }
        assert!(added <= 1);
    }

    #[tokio::test]
    async fn fetch_all_merges_every_peer() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![counter_registry(3.0)]);
        let b = start(&hub, 2, vec![counter_registry(5.0)]);
        let c = start(&hub, 3, vec![counter_registry(7.0)]);
        wait_for_peers(&a, 3).await;
        hub.clear_log();

        let lists = a.fetch_all().await.unwrap();
        assert_eq!(lists.len(), 3);
        assert_eq!(requests(&hub).len(), 1);

        let merged = aggregate(&lists);
        let total = merged
            .get("http_request_total")
            .and_then(|f| f.value("http_request_total", &Labels::new()));
        assert_eq!(total, Some(15.0));
        wait_until("both answers counted", || {
            b.requests_answered() + c.requests_answered() == 2
        })
        .await;
    }

    #[tokio::test]
    async fn fetch_by_nodes_puts_local_first() {
        let hub = MemoryHub::new("t");
        let registry = Registry::new();
        registry
            .register(Gauge::new("current_cluster", "index").with_aggregator(Aggregator::First).with_collect(|g| g.set(1.0)))
            .unwrap();
        let a = start(&hub, 1, vec![registry]);

        let remote = Registry::new();
        remote
            .register(Gauge::new("current_cluster", "index").with_aggregator(Aggregator::First).with_collect(|g| g.set(2.0)))
            .unwrap();
        let _b = start(&hub, 2, vec![remote]);
        wait_for_peers(&a, 2).await;

        let text = a.metrics(&[2, 1]).await.unwrap();
        assert!(text.contains("current_cluster 1\n"), "{text}");
    }

    #[tokio::test]
    async fn only_targeted_peers_answer() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![counter_registry(1.0)]);
        let b = start(&hub, 2, vec![counter_registry(1.0)]);
        let c = start(&hub, 3, vec![counter_registry(1.0)]);
        wait_for_peers(&a, 3).await;
        hub.clear_log();

        let lists = a.fetch_by_nodes(&[3]).await.unwrap();
        assert_eq!(lists.len(), 1);
        let sent = requests(&hub);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].targets(), Some(&[3][..]));

        wait_until("peer 3 answer counted", || c.requests_answered() == 1).await;
        assert_eq!(b.requests_answered(), 0);
    }

    #[tokio::test]
    async fn duplicate_targets_count_once() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![]);
        let _b = start(&hub, 2, vec![counter_registry(2.0)]);
        let _c = start(&hub, 3, vec![counter_registry(3.0)]);
        wait_for_peers(&a, 3).await;
        hub.clear_log();

        let lists = a.fetch_by_nodes(&[2, 2]).await.unwrap();
        assert_eq!(lists.len(), 1);
        let lists = a.fetch_remote(Some(&[3, 2, 3, 2])).await.unwrap();
        assert_eq!(lists.len(), 2);

        let sent = requests(&hub);
        assert_eq!(sent[0].targets(), Some(&[2][..]));
        assert_eq!(sent[1].targets(), Some(&[2, 3][..]));
    }

    #[tokio::test]
    async fn unknown_targets_short_circuit() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![]);
        assert!(a.fetch_by_nodes(&[9]).await.unwrap().is_empty());
        assert_eq!(a.fetch_by_nodes(&[1]).await.unwrap().len(), 0);
        assert!(requests(&hub).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![]);
        let _mute = mute_peer(&hub, 2);
        wait_for_peers(&a, 2).await;

        let err = a.fetch_remote(None).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { expected: 1, received: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_in_flight_during_dispose_times_out() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![]);
        let _mute = mute_peer(&hub, 2);
        wait_for_peers(&a, 2).await;
        hub.clear_log();

        let started = tokio::time::Instant::now();
        let fetch = tokio::spawn({
            let a = a.clone();
            async move { a.fetch_remote(None).await }
        });
        wait_until("request posted", || !requests(&hub).is_empty()).await;
        a.dispose();

        let err = fetch.await.unwrap().unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { expected: 1, received: 0, .. }), "{err}");
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn fetch_after_dispose_is_rejected() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![counter_registry(1.0)]);
        let _mute = mute_peer(&hub, 2);
        wait_for_peers(&a, 2).await;

        a.dispose();
        hub.clear_log();
        assert!(matches!(a.fetch_remote(None).await, Err(ClusterError::Disposed)));
        assert!(matches!(a.fetch_all().await, Err(ClusterError::Disposed)));
        assert!(requests(&hub).is_empty());
    }

    #[tokio::test]
    async fn failing_transport_serves_local_only() {
        let transport = Arc::new(BrokenTransport::new());
        let inbox = transport.inbox.clone();
        let a = Cluster::start(fast_config(), 1, transport, vec![counter_registry(4.0)]).unwrap();

        let keepalive = Message::Keepalive {
            id: "k".to_string(),
            index: 2,
        };
        inbox.send(keepalive.encode().unwrap()).unwrap();
        wait_for_peers(&a, 2).await;

        assert!(a.fetch_remote(None).await.unwrap().is_empty());
        let lists = a.fetch_all().await.unwrap();
        assert_eq!(lists.len(), 1);
        let text = a.metrics(&[]).await.unwrap();
        assert!(text.contains("http_request_total 4\n"), "{text}");
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let hub = MemoryHub::new("t");
        let a = start(&hub, 1, vec![]);
        let rogue = hub.connect();
        rogue.post(Bytes::from_static(b"{\"type\":\"keepalive\"}")).unwrap();
        rogue.post(Bytes::from_static(b"garbage")).unwrap();
        // Frames from one member arrive in order, so once the keepalive
        // lands the garbage has been handled.
        let keepalive = Message::Keepalive {
            id: "k".to_string(),
            index: 5,
        };
        rogue.post(keepalive.encode().unwrap()).unwrap();
        wait_for_peers(&a, 2).await;

        assert_eq!(a.known_peers(), vec![5]);
        assert!(!a.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_is_idempotent_and_stops_heartbeats() {
        let hub = MemoryHub::new("t");
        let registry = counter_registry(1.0);
        let a = start(&hub, 1, vec![registry.clone()]);
        wait_until("first keepalive", || !hub.posted().is_empty()).await;

        a.dispose();
        a.dispose();
        assert!(a.is_disposed());
        assert!(registry.is_empty());

        let posted = hub.posted().len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hub.posted().len(), posted);
    }

    #[tokio::test]
    async fn dropping_last_handle_disposes() {
        let hub = MemoryHub::new("t");
        let registry = counter_registry(1.0);
        let a = start(&hub, 1, vec![registry.clone()]);
        drop(a);
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn thousands_of_series_cross_unix_sockets() {
        use crate::transport::unix::UnixTransport;

        let dir = tempfile::tempdir().unwrap();
        let connect = |index| {
            Arc::new(UnixTransport::bind(dir.path(), "cluster-big", index).unwrap())
                as Arc<dyn Transport>
        };

        let big = Registry::new();
        let counter = Counter::new("http_request_status", "requests by path");
        for i in 0..4000 {
            counter.inc_with(&labels(&[("path", &format!("/api/v1/tenants/acme/resources/{i}"))]), 1.0);
        }
        big.register(counter).unwrap();

        let a = Cluster::start(fast_config(), 1, connect(1), vec![]).unwrap();
        let _b = Cluster::start(fast_config(), 2, connect(2), vec![big]).unwrap();
        wait_for_peers(&a, 2).await;

        let lists = a.fetch_remote(None).await.unwrap();
        assert_eq!(lists.len(), 1);
        let frame_len = Message::MetricResponse {
            id: "x".to_string(),
            index: 2,
            targets: vec![1],
            metrics: lists[0].clone(),
        }
        .encode()
        .unwrap()
        .len();
        assert!(frame_len > 212_992, "{frame_len}");
        assert_eq!(lists[0][0].samples.len(), 4000);
    }
}
