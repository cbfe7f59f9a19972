//! Store adapter errors.

use thiserror::Error;

/// Errors from coordination-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist (error code 100 on the wire).
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Exclusive create lost to an existing key (error code 105 on the
    /// wire). This is the normal lock-contention outcome.
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// A watch event carried an action this adapter does not understand.
    #[error("unknown store action: {0}")]
    UnknownAction(String),

    /// The store answered with something that does not parse as the v2
    /// protocol.
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// The request never produced a store-level answer.
    #[error("store transport error: {0}")]
    Transport(String),

    /// Every configured endpoint refused the request.
    #[error("no store endpoint reachable")]
    Unavailable,
}

impl StoreError {
    /// True for the errors a lock-acquisition caller treats as "a peer got
    /// there first" rather than a fault.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
