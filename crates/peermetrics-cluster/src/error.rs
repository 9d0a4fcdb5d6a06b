//! Error types for cluster operations.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by the cluster handle.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A metrics fetch missed its deadline. Partial results are discarded.
    #[error("metrics request {id} timed out after {timeout_ms}ms ({received}/{expected} responses)")]
    Timeout {
        id: String,
        expected: usize,
        received: usize,
        timeout_ms: u64,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid cluster config: {0}")]
    InvalidConfig(String),

    #[error("cluster handle disposed")]
    Disposed,
}

/// Errors raised by a [`crate::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport already has a subscriber")]
    AlreadySubscribed,

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("transport needs a tokio runtime")]
    NoRuntime,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
