//! Change notifications delivered by a remote store.

use crate::error::ProtocolResult;
use crate::record::{ColumnSet, Row};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    /// Row was inserted.
    Insert,
    /// Row was updated.
    Update,
    /// Row was deleted.
    Delete,
}

/// A single row change, emitted after the store commits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Commit sequence number assigned by the store.
    pub sequence: u64,
    /// Table the row belongs to.
    pub table: String,
    /// Type of change.
    pub change_type: ChangeType,
    /// Row after the change (Insert/Update).
    pub new: Option<Row>,
    /// Row before the change (Update/Delete).
    pub old: Option<Row>,
}

impl ChangeEvent {
    /// Creates an insert event.
    pub fn insert(sequence: u64, table: impl Into<String>, new: Row) -> Self {
        Self {
            sequence,
            table: table.into(),
            change_type: ChangeType::Insert,
            new: Some(new),
            old: None,
        }
    }

    /// Creates an update event.
    pub fn update(sequence: u64, table: impl Into<String>, new: Row, old: Row) -> Self {
        Self {
            sequence,
            table: table.into(),
            change_type: ChangeType::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    /// Creates a delete event.
    pub fn delete(sequence: u64, table: impl Into<String>, old: Row) -> Self {
        Self {
            sequence,
            table: table.into(),
            change_type: ChangeType::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// The row a selector should be tested against.
    pub fn subject(&self) -> Option<&Row> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Decodes the new row's payload and stamps.
    pub fn remote_change(&self, columns: &ColumnSet) -> ProtocolResult<RemoteChange> {
        let Some(new) = &self.new else {
            return Ok(RemoteChange::default());
        };
        let state = columns.decode(new)?;

        Ok(RemoteChange {
            id: new.get(&columns.id).cloned(),
            data: state.data,
            timestamp: state.timestamp,
            version: state.version,
        })
    }
}

/// The part of a change event the conflict resolver looks at.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteChange {
    /// Id of the changed row.
    pub id: Option<Value>,
    /// New payload; `None` means the event carries nothing to apply.
    pub data: Option<Value>,
    /// Remote write time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Remote write counter.
    pub version: Option<i64>,
}
