//! Transport error types.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by a [`crate::Messenger`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel name cannot be empty")]
    EmptyChannel,

    #[error("transport is shut down")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),
}
