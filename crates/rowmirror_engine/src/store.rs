//! Remote store abstraction.
//!
//! A session talks to its backing table only through [`RemoteStore`]:
//! column-projected selects, single-row upserts and change subscriptions.
//! [`MemoryStore`](crate::MemoryStore) is the in-process implementation.

use crate::error::StoreResult;
use async_trait::async_trait;
use rowmirror_protocol::{ChangeEvent, ChangeType, Query, Row, UpsertRecord};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A table-oriented remote store with a change feed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the projected rows selected by `query`.
    async fn select(&self, query: &Query) -> StoreResult<Vec<Row>>;

    /// Inserts or updates one row.
    async fn upsert(&self, upsert: &UpsertRecord) -> StoreResult<()>;

    /// Opens a change channel.
    async fn subscribe(&self, request: ChannelRequest) -> StoreResult<Subscription>;

    /// Closes a change channel. Events stop arriving once this returns.
    async fn unsubscribe(&self, id: Uuid) -> StoreResult<()>;
}

/// Parameters of a change channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    /// Table to listen on.
    pub table: String,
    /// Change type to deliver.
    pub event: ChangeType,
    /// Row filter in `column=op.value` form.
    pub filter: String,
}

impl ChannelRequest {
    /// Creates a request for update events on `table`.
    pub fn updates(table: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: ChangeType::Update,
            filter: filter.into(),
        }
    }
}

/// An open change channel.
#[derive(Debug)]
pub struct Subscription {
    /// Channel id, used to unsubscribe.
    pub id: Uuid,
    /// Events in commit order.
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}
