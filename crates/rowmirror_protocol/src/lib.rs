//! # rowmirror Protocol
//!
//! Record, query and conflict types for rowmirror.
//!
//! This crate provides:
//! - `TreeValue` for the contents of a live local tree
//! - The serializer that turns a tree into a transport-safe snapshot
//! - The `/table/id` path grammar
//! - Filter expressions (`column=op.value`)
//! - Query, upsert and change-event shapes for the remote store
//! - `ConflictPolicy` for deciding whether a remote change supersedes local state
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod error;
mod filter;
mod path;
mod record;
mod serializer;
mod value;

pub use change::{ChangeEvent, ChangeType, RemoteChange};
pub use conflict::{Conflict, ConflictPolicy, ConflictResolution, Stamp};
pub use error::{ProtocolError, ProtocolResult};
pub use filter::{FilterExpr, FilterOp, Predicate};
pub use path::RecordPath;
pub use record::{now_timestamp, ColumnSet, Query, RecordState, Row, Selector, UpsertRecord};
pub use serializer::{is_reserved_key, to_plain, RESERVED_MARKERS};
pub use value::{Opaque, TreeMap, TreeValue};
