//! Session-facing adapter over a [`RemoteStore`].
//!
//! Builds the queries, upserts and change channels a session needs from
//! its configuration, so the session itself never deals with columns.

use crate::config::{SessionConfig, Target};
use crate::error::{SessionError, SessionResult};
use crate::store::{ChannelRequest, RemoteStore};
use chrono::{DateTime, Utc};
use rowmirror_protocol::{ColumnSet, Query, RemoteChange, Row, Selector, UpsertRecord};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// An open change channel and the task draining it.
#[derive(Debug)]
pub struct ChannelHandle {
    id: Uuid,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Store-assigned channel id.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Remote operations for one session.
#[derive(Clone)]
pub struct RemoteGateway {
    store: Arc<dyn RemoteStore>,
    table: String,
    target: Target,
    selector: Selector,
    columns: ColumnSet,
}

impl RemoteGateway {
    /// Creates a gateway from a validated configuration.
    pub fn new(config: &SessionConfig) -> SessionResult<Self> {
        let store = config.store.clone().ok_or_else(|| {
            SessionError::Configuration("a remote store handle is required".into())
        })?;
        Ok(Self {
            store,
            table: config.table.clone(),
            target: config.target.clone(),
            selector: config.selector(),
            columns: config.columns.clone(),
        })
    }

    /// Column layout used for encoding and decoding.
    pub fn columns(&self) -> &ColumnSet {
        &self.columns
    }

    /// Builds the read query for the configured target.
    pub fn build_query(&self) -> Query {
        let projection = self.columns.projection();
        match &self.target {
            Target::Record { id } => {
                Query::record(&self.table, projection, &self.columns.id, id.clone())
            }
            Target::Filter(filter) => Query::filtered(&self.table, projection, filter.clone()),
        }
    }

    /// Fetches the selected rows.
    pub async fn read(&self) -> SessionResult<Vec<Row>> {
        let query = self.build_query();
        let rows = self.store.select(&query).await?;
        debug!(table = %self.table, rows = rows.len(), "read remote rows");
        Ok(rows)
    }

    /// Writes the record and reads it back.
    ///
    /// Only single-record sessions can write. A write the store accepts but
    /// does not return on re-select is reported as unconfirmed.
    pub async fn upsert(
        &self,
        data: Value,
        timestamp: DateTime<Utc>,
        version: Option<i64>,
    ) -> SessionResult<Row> {
        let Target::Record { id } = &self.target else {
            return Err(SessionError::UnsupportedOperation(
                "writing a multi-record session",
            ));
        };

        let row = self.columns.encode(id, data, timestamp, version);
        let upsert = UpsertRecord::new(&self.table, &self.columns.id, row);
        self.store.upsert(&upsert).await?;

        let confirm = Query::record(
            &self.table,
            self.columns.projection(),
            &self.columns.id,
            id.clone(),
        );
        let mut rows = self.store.select(&confirm).await?;
        if rows.is_empty() {
            return Err(SessionError::WriteNotConfirmed {
                table: self.table.clone(),
                id: match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            });
        }
        Ok(rows.swap_remove(0))
    }

    /// Opens a change channel for update events on the selected rows.
    ///
    /// `handler` runs once per decoded change, in delivery order. Events
    /// that fail to decode are logged and dropped.
    pub async fn subscribe<F, Fut>(&self, handler: F) -> SessionResult<ChannelHandle>
    where
        F: Fn(RemoteChange) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let request = ChannelRequest::updates(&self.table, self.selector.channel_filter());
        let subscription = self.store.subscribe(request).await?;
        let id = subscription.id;
        let columns = self.columns.clone();
        let mut events = subscription.events;

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event.remote_change(&columns) {
                    Ok(change) => handler(change).await,
                    Err(e) => {
                        warn!(sequence = event.sequence, error = %e, "dropping undecodable change")
                    }
                }
            }
        });

        debug!(table = %self.table, channel = %id, "subscribed");
        Ok(ChannelHandle { id, task })
    }

    /// Closes a change channel. No handler runs after this returns `Ok`.
    ///
    /// If the store refuses, the channel stays open and `handle` remains
    /// valid.
    pub async fn unsubscribe(&self, handle: &ChannelHandle) -> SessionResult<()> {
        self.store.unsubscribe(handle.id).await?;
        handle.task.abort();
        debug!(table = %self.table, channel = %handle.id, "unsubscribed");
        Ok(())
    }
}

impl std::fmt::Debug for RemoteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGateway")
            .field("table", &self.table)
            .field("target", &self.target)
            .field("columns", &self.columns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use rowmirror_protocol::{now_timestamp, FilterExpr};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn gateway(store: &Arc<MemoryStore>, config: SessionConfig) -> RemoteGateway {
        RemoteGateway::new(&config.with_store(store.clone())).unwrap()
    }

    #[test]
    fn builds_record_and_filter_queries() {
        let store = Arc::new(MemoryStore::new());
        let record = gateway(&store, SessionConfig::record("t", "k"));
        let query = record.build_query();
        assert_eq!(query.limit, Some(1));
        assert_eq!(query.columns, vec!["id", "updated_at", "data"]);

        let filter = gateway(
            &store,
            SessionConfig::filtered("t", FilterExpr::parse("a=gt.1").unwrap()),
        );
        assert_eq!(filter.build_query().limit, None);
    }

    #[tokio::test]
    async fn upsert_returns_the_stored_row() {
        let store = Arc::new(MemoryStore::new());
        let gw = gateway(&store, SessionConfig::record("t", "k"));
        let ts = now_timestamp();

        let row = gw.upsert(json!({"a": 1}), ts, None).await.unwrap();
        assert_eq!(row["data"], json!({"a": 1}));
        assert_eq!(gw.read().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_writes_fail() {
        let store = Arc::new(MemoryStore::new());
        store.set_discard_writes(true);
        let gw = gateway(&store, SessionConfig::record("t", 4));

        let err = gw.upsert(json!({}), now_timestamp(), None).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::WriteNotConfirmed {
                table: "t".into(),
                id: "4".into()
            }
        );
    }

    #[tokio::test]
    async fn filtered_sessions_cannot_write() {
        let store = Arc::new(MemoryStore::new());
        let gw = gateway(
            &store,
            SessionConfig::filtered("t", FilterExpr::parse("a=eq.1").unwrap()),
        );
        assert!(matches!(
            gw.upsert(json!({}), now_timestamp(), None).await,
            Err(SessionError::UnsupportedOperation(_))
        ));
        assert_eq!(store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_delivers_decoded_updates_until_unsubscribed() {
        let store = Arc::new(MemoryStore::new());
        let gw = gateway(&store, SessionConfig::record("t", "k"));
        gw.upsert(json!({"n": 0}), now_timestamp(), None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = gw
            .subscribe(move |change| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(change);
                }
            })
            .await
            .unwrap();

        gw.upsert(json!({"n": 1}), now_timestamp(), None).await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.data, Some(json!({"n": 1})));
        assert_eq!(change.id, Some(json!("k")));

        gw.unsubscribe(&handle).await.unwrap();
        assert_eq!(store.subscription_count(), 0);
        gw.upsert(json!({"n": 2}), now_timestamp(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
