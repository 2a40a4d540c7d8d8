//! In-process remote store.
//!
//! Holds tables as vectors of rows and fans committed changes out to
//! subscribers, filtered the same way a hosted change feed would. Useful
//! for tests and for embedding the engine without a network.

use crate::error::{StoreError, StoreResult};
use crate::store::{ChannelRequest, RemoteStore, Subscription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rowmirror_protocol::{ChangeEvent, ChangeType, FilterExpr, Query, Row, Selector, UpsertRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

struct Subscriber {
    table: String,
    event: ChangeType,
    filter: FilterExpr,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// A [`RemoteStore`] kept entirely in memory.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    sequence: AtomicU64,
    connected: AtomicBool,
    discard_writes: AtomicBool,
    upserts: AtomicU64,
    selects: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty, connected store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            discard_writes: AtomicBool::new(false),
            upserts: AtomicU64::new(0),
            selects: AtomicU64::new(0),
        }
    }

    /// Appends rows to a table without emitting change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Returns the row whose `column` equals `id`.
    pub fn row(&self, table: &str, column: &str, id: &Value) -> Option<Row> {
        let key = Selector::record(column, id.clone());
        self.tables
            .read()
            .get(table)?
            .iter()
            .find(|row| key.matches(row))
            .cloned()
    }

    /// Returns every row of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Deletes the row whose `column` equals `id`, emitting a delete event.
    pub fn delete(&self, table: &str, column: &str, id: &Value) -> Option<Row> {
        let mut tables = self.tables.write();
        let rows = tables.get_mut(table)?;
        let key = Selector::record(column, id.clone());
        let index = rows.iter().position(|row| key.matches(row))?;
        let old = rows.remove(index);
        let sequence = self.next_sequence();
        self.publish(ChangeEvent::delete(sequence, table, old.clone()));
        Some(old)
    }

    /// Sets the connected state. A disconnected store fails every call.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes upserts succeed without storing anything.
    pub fn set_discard_writes(&self, discard: bool) {
        self.discard_writes.store(discard, Ordering::SeqCst);
    }

    /// Number of upserts received.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of selects received.
    pub fn select_count(&self) -> u64 {
        self.selects.load(Ordering::SeqCst)
    }

    /// Number of open change channels.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn ensure_connected(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Delivers an event to matching subscribers, pruning closed ones.
    fn publish(&self, event: ChangeEvent) {
        let Some(subject) = event.subject().cloned() else {
            return;
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, sub| {
            if sub.table != event.table
                || sub.event != event.change_type
                || !sub.filter.matches(&subject)
            {
                return true;
            }
            trace!(subscription = %id, sequence = event.sequence, "delivering change");
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("tables", &self.tables.read().len())
            .field("subscriptions", &self.subscription_count())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, query: &Query) -> StoreResult<Vec<Row>> {
        self.ensure_connected()?;
        self.selects.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read();
        let Some(rows) = tables.get(&query.table) else {
            return Ok(Vec::new());
        };
        let selected = rows
            .iter()
            .filter(|row| query.selector.matches(row))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|row| query.project(row))
            .collect();
        Ok(selected)
    }

    async fn upsert(&self, upsert: &UpsertRecord) -> StoreResult<()> {
        self.ensure_connected()?;
        self.upserts.fetch_add(1, Ordering::SeqCst);

        let key = upsert.key().cloned().ok_or_else(|| {
            StoreError::Rejected(format!(
                "row has no value for conflict column {}",
                upsert.conflict_column
            ))
        })?;
        if self.discard_writes.load(Ordering::SeqCst) {
            return Ok(());
        }

        let selector = Selector::record(&upsert.conflict_column, key);
        let mut tables = self.tables.write();
        let rows = tables.entry(upsert.table.clone()).or_default();
        let existing = rows.iter_mut().find(|row| selector.matches(row));

        let event = match existing {
            Some(_) if upsert.ignore_duplicates => return Ok(()),
            Some(row) => {
                let old = row.clone();
                // The stored key keeps its column type.
                for (column, value) in &upsert.row {
                    if *column != upsert.conflict_column {
                        row.insert(column.clone(), value.clone());
                    }
                }
                ChangeEvent::update(self.next_sequence(), &upsert.table, row.clone(), old)
            }
            None => {
                rows.push(upsert.row.clone());
                ChangeEvent::insert(self.next_sequence(), &upsert.table, upsert.row.clone())
            }
        };
        // Published under the table lock so subscribers see commit order.
        self.publish(event);
        Ok(())
    }

    async fn subscribe(&self, request: ChannelRequest) -> StoreResult<Subscription> {
        self.ensure_connected()?;
        let filter = FilterExpr::parse(&request.filter)
            .map_err(|e| StoreError::Rejected(e.to_string()))?;

        let id = Uuid::new_v4();
        let (tx, events) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(
            id,
            Subscriber {
                table: request.table,
                event: request.event,
                filter,
                tx,
            },
        );
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: Uuid) -> StoreResult<()> {
        self.ensure_connected()?;
        self.subscribers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::UnknownSubscription(id))
    }
}
