//! Error types for the sync engine.

use rowmirror_protocol::ProtocolError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type for remote store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The store is not reachable.
    #[error("not connected to remote store")]
    NotConnected,

    /// The store refused a write.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The subscription id is not known to the store.
    #[error("unknown subscription {0}")]
    UnknownSubscription(Uuid),
}

impl StoreError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport { retryable, .. } => *retryable,
            StoreError::NotConnected => true,
            _ => false,
        }
    }
}

/// Errors that can occur during session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session was set up without something it needs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `/table/id` path did not match the grammar.
    #[error("invalid record path {0:?}: expected /table/id")]
    PathParse(String),

    /// An operation was entered while a conflicting one was running.
    #[error("reentrancy error: {0}")]
    Reentrancy(&'static str),

    /// The session mode does not support the operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Remote store failure.
    #[error("remote store error: {0}")]
    Store(#[from] StoreError),

    /// An upsert returned but the row could not be read back.
    #[error("write to {table} for id {id} was not confirmed")]
    WriteNotConfirmed {
        /// Table written.
        table: String,
        /// Record id written.
        id: String,
    },

    /// The record version cannot be advanced any further.
    #[error("record version {0} cannot be incremented")]
    VersionOverflow(i64),

    /// A local write stopped before reporting a result.
    #[error("local write aborted before completion")]
    WriteAborted,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted operation or target state.
        to: String,
    },

    /// Malformed record, filter or tree access.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::PathParse(path) => SessionError::PathParse(path),
            other => SessionError::Protocol(other),
        }
    }
}

impl SessionError {
    /// Returns true if the error reflects a caller bug rather than a
    /// remote failure.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            SessionError::Configuration(_)
                | SessionError::PathParse(_)
                | SessionError::Reentrancy(_)
                | SessionError::InvalidStateTransition { .. }
        )
    }

    /// Returns true if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Store(err) => err.is_retryable(),
            SessionError::WriteNotConfirmed { .. } => true,
            _ => false,
        }
    }
}
