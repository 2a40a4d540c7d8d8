//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or shaping protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A `/table/id` path did not match the grammar.
    #[error("invalid record path {0:?}: expected /table/id")]
    PathParse(String),

    /// A filter expression could not be parsed.
    #[error("invalid filter expression {expr:?}: {reason}")]
    InvalidFilter {
        /// The offending expression.
        expr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A key starting with a reserved marker was written to a tree.
    #[error("key {0:?} starts with a reserved marker")]
    ReservedKey(String),

    /// A keyed or indexed write hit a value of the wrong shape.
    #[error("expected {expected}, found {found}")]
    NotAContainer {
        /// The container kind the operation needs.
        expected: &'static str,
        /// The kind actually present.
        found: &'static str,
    },

    /// A remote row did not have the expected columns or types.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
