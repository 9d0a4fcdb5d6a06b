//! Error types for registry operations.

use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while registering instruments.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instrument already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid metric name: {0:?}")]
    InvalidName(String),
}
