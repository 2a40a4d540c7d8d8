//! Test fixtures and store helpers.
//!
//! Provides a seeded in-memory store and session configs with delays
//! short enough for tests.

use rowmirror_engine::{
    ColumnSet, MemoryStore, Mirror, RemoteStore, SessionConfig, StoreResult, SyncSession,
};
use rowmirror_protocol::{now_timestamp, Row, UpsertRecord};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default table used by fixtures.
pub const TEST_TABLE: &str = "records";

/// Write-lock settle delay used by test sessions.
pub const TEST_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Flush delay used by test sessions.
pub const TEST_FLUSH_DELAY: Duration = Duration::from_millis(30);

/// An in-memory store plus the layout of its test table.
#[derive(Debug, Clone)]
pub struct StoreFixture {
    /// The store.
    pub store: Arc<MemoryStore>,
    /// Table name.
    pub table: String,
    /// Column layout.
    pub columns: ColumnSet,
}

impl StoreFixture {
    /// Creates an empty store with a versioned layout.
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            table: TEST_TABLE.to_string(),
            columns: ColumnSet::default().with_version("version"),
        }
    }

    /// Switches to an unversioned, timestamp-only layout.
    #[must_use]
    pub fn unversioned(mut self) -> Self {
        self.columns.version = None;
        self
    }

    /// Seeds one record without emitting change events.
    #[must_use]
    pub fn with_record(self, id: &str, data: Value, version: Option<i64>) -> Self {
        let row = self.record_row(id, data, version);
        self.store.seed(&self.table, [row]);
        self
    }

    /// Builds the row a client would write for `id`.
    pub fn record_row(&self, id: &str, data: Value, version: Option<i64>) -> Row {
        self.columns
            .encode(&Value::from(id), data, now_timestamp(), version)
    }

    /// Session config for one record of the fixture table.
    pub fn config(&self, id: &str) -> SessionConfig {
        quick_config(SessionConfig::record(&self.table, id), self)
    }

    /// Creates and initializes a session for one record.
    ///
    /// # Panics
    ///
    /// Panics if initialization fails.
    pub async fn start(&self, id: &str) -> (SyncSession, Mirror) {
        start_session(self.config(id)).await
    }

    /// Writes a record the way another client would.
    pub async fn remote_write(
        &self,
        id: &str,
        data: Value,
        version: Option<i64>,
    ) -> StoreResult<()> {
        let row = self.record_row(id, data, version);
        self.store
            .upsert(&UpsertRecord::new(&self.table, &self.columns.id, row))
            .await
    }

    /// Returns the stored payload of a record.
    pub fn stored_data(&self, id: &str) -> Option<Value> {
        self.store
            .row(&self.table, &self.columns.id, &Value::from(id))
            .and_then(|row| row.get(&self.columns.data).cloned())
    }
}

impl Default for StoreFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the fixture's store, columns and short test delays.
pub fn quick_config(config: SessionConfig, fixture: &StoreFixture) -> SessionConfig {
    config
        .with_store(fixture.store.clone())
        .with_columns(fixture.columns.clone())
        .with_settle_delay(TEST_SETTLE_DELAY)
        .with_flush_delay(TEST_FLUSH_DELAY)
}

/// Creates and initializes a session.
///
/// # Panics
///
/// Panics if initialization fails.
pub async fn start_session(config: SessionConfig) -> (SyncSession, Mirror) {
    let session = SyncSession::new(config);
    let mirror = session
        .init()
        .await
        .expect("Failed to initialize session");
    (session, mirror)
}

/// Sleeps for `ms` milliseconds.
pub async fn pause(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fixture_seeds_and_starts() {
        let fixture = StoreFixture::new().with_record("r1", json!({"a": 1}), Some(0));
        let (session, mirror) = fixture.start("r1").await;

        assert_eq!(mirror.data.to_plain(), json!({"a": 1}));
        assert_eq!(session.meta().version, Some(0));
        assert_eq!(fixture.stored_data("r1"), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn remote_writes_reach_sessions() {
        let fixture = StoreFixture::new()
            .unversioned()
            .with_record("r2", json!({}), None);
        let (_session, mirror) = fixture.start("r2").await;

        pause(5).await;
        fixture.remote_write("r2", json!({"b": 2}), None).await.unwrap();
        pause(50).await;

        assert_eq!(mirror.data.to_plain(), json!({"b": 2}));
    }
}
