//! # Rowmirror Engine
//!
//! Two-way sync between a live local tree and remote table rows.
//!
//! This crate provides:
//! - Observable trees and a tokio-backed observation runtime
//! - Change detection with optional debouncing
//! - Write-lock based echo suppression
//! - A remote store abstraction and an in-memory store
//! - The [`SyncSession`] façade
//!
//! ## Architecture
//!
//! A session mirrors either one record or a filtered set of rows:
//! 1. `init` reads the remote state into the local tree
//! 2. Local mutations are detected, serialized and upserted
//! 3. Remote update events are checked for freshness and applied
//!
//! Applying remote state holds the write lock, so the detector never
//! republishes what it just received. A session's own write echoing back
//! carries the version or timestamp it already holds and is rejected as
//! stale.
//!
//! ## Key Invariants
//!
//! - At most one write is pending per session
//! - The local version only moves forward, once per accepted local write
//! - Mutations made while the write lock is held are never written back
//! - Reserved-marker keys (`$`, `_`) never reach the remote store
//!
//! ## Example
//!
//! ```no_run
//! use rowmirror_engine::{MemoryStore, SessionConfig, SyncSession};
//! use std::sync::Arc;
//!
//! # async fn demo() -> rowmirror_engine::SessionResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let session = SyncSession::new(SessionConfig::from_path("/notes/n1")?.with_store(store));
//! let mirror = session.init().await?;
//!
//! mirror.data.insert("title", "hello")?;
//! session.flush().await?;
//! session.destroy().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod detector;
mod error;
mod gateway;
mod lock;
mod memory;
mod observable;
mod pending;
mod session;
mod store;

pub use config::{Hook, SessionConfig, SessionHooks, Target, ThrottleConfig};
pub use detector::{BurstFuture, BurstHandler, ChangeDetector};
pub use error::{SessionError, SessionResult, StoreError, StoreResult};
pub use gateway::{ChannelHandle, RemoteGateway};
pub use lock::{WriteGuard, WriteLock};
pub use memory::MemoryStore;
pub use observable::{
    BatchCallback, LiveTree, Mutation, MutationBatch, Observable, Observer, SharedTree,
    TokioObservable,
};
pub use pending::{InFlight, PendingWrite, WriteStatus};
pub use session::{
    init, Mirror, ReadOptions, SessionMeta, SessionState, SessionStats, SetOptions, SyncSession,
};
pub use store::{ChannelRequest, RemoteStore, Subscription};

pub use rowmirror_protocol::{
    ColumnSet, FilterExpr, ProtocolError, RecordPath, TreeValue,
};
