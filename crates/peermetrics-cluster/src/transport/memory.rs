//! In-process transport for tests and single-binary setups.
//!
//! All members connected to one [`MemoryHub`] share a tokio broadcast
//! channel. The hub also keeps a log of every posted frame so tests can
//! count traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::message::Message;
use crate::transport::{Incoming, Transport};

const HUB_CAPACITY: usize = 1024;

struct HubInner {
    topic: String,
    tx: broadcast::Sender<(u64, Bytes)>,
    posted: Mutex<Vec<Bytes>>,
    next_member: AtomicU64,
}

/// Shared medium for [`MemoryTransport`] members.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new(topic: &str) -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                topic: topic.to_string(),
                tx,
                posted: Mutex::new(Vec::new()),
                next_member: AtomicU64::new(0),
            }),
        }
    }

    /// Create a new member of this hub.
    pub fn connect(&self) -> MemoryTransport {
        MemoryTransport {
            member: self.inner.next_member.fetch_add(1, Ordering::Relaxed),
            hub: self.clone(),
            closed: AtomicBool::new(false),
            forwarder: Mutex::new(None),
        }
    }

    /// Every frame posted so far, in posting order.
    pub fn posted(&self) -> Vec<Bytes> {
        self.inner.posted.lock().clone()
    }

    /// Posted frames that decode as messages.
    pub fn posted_messages(&self) -> Vec<Message> {
        self.posted()
            .iter()
            .filter_map(|f| Message::decode(f).ok())
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.posted.lock().clear();
    }
}

/// One member of a [`MemoryHub`].
pub struct MemoryTransport {
    member: u64,
    hub: MemoryHub,
    closed: AtomicBool,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Transport for MemoryTransport {
    fn topic(&self) -> &str {
        &self.hub.inner.topic
    }

    fn post(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.hub.inner.posted.lock().push(frame.clone());
        // No receivers is fine: nobody else is listening yet.
        let _ = self.hub.inner.tx.send((self.member, frame));
        Ok(())
    }

    fn subscribe(&self) -> Result<Incoming, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut slot = self.forwarder.lock();
        if slot.is_some() {
            return Err(TransportError::AlreadySubscribed);
        }

        let mut rx = self.hub.inner.tx.subscribe();
        let (out, incoming) = mpsc::unbounded_channel();
        let member = self.member;
        *slot = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((from, _)) if from == member => {}
                    Ok((_, frame)) => {
                        if out.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(member, skipped, "memory transport lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        debug!(member, topic = %self.hub.inner.topic, "memory transport subscribed");
        Ok(incoming)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
        debug!(member = self.member, "memory transport closed");
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
