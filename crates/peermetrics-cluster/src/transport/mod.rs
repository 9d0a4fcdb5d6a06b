//! Broadcast transports.
//!
//! A transport delivers every posted frame to all other members of the
//! same topic, best effort and in no particular order. A member never
//! receives its own frames.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod memory;
#[cfg(unix)]
pub mod unix;

/// Stream of frames posted by other members.
pub type Incoming = mpsc::UnboundedReceiver<Bytes>;

pub trait Transport: Send + Sync + 'static {
    /// Topic shared by the process group.
    fn topic(&self) -> &str;

    /// Broadcast one frame to every other member. Delivery may complete
    /// after this returns.
    fn post(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Start receiving. A transport has at most one subscriber. Must be
    /// called from within a tokio runtime.
    fn subscribe(&self) -> Result<Incoming, TransportError>;

    /// Stop receiving and release resources. Idempotent.
    fn close(&self);
}
