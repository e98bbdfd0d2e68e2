//! Client error types.

use thiserror::Error;

use crate::connection::ConnectionId;

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client and its backend connections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("too many pending tasks ({pending} queued, limit {limit})")]
    AdmissionRejected { pending: usize, limit: usize },

    #[error("not in any execution scope")]
    NoActiveScope,

    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("failed to open connection: {0}")]
    ConnectionOpenFailed(String),

    #[error("commit failed on connection {id}: {reason}")]
    CommitFailed { id: ConnectionId, reason: String },

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("task was dropped before it settled")]
    TaskAborted,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid document: {0}")]
    Document(String),
}

impl ClientError {
    /// Whether this is a synchronous admission-control rejection.
    pub fn is_admission_rejected(&self) -> bool {
        matches!(self, ClientError::AdmissionRejected { .. })
    }
}
