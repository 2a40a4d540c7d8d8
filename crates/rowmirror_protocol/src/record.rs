//! Remote record shapes: columns, queries and upserts.

use crate::error::{ProtocolError, ProtocolResult};
use crate::filter::FilterExpr;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A remote row: column name to value.
pub type Row = Map<String, Value>;

/// Returns the current time at the precision stored remotely.
///
/// Timestamps are truncated to microseconds so a value survives the trip
/// through a row unchanged and compares equal to its own echo.
pub fn now_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Names of the columns a mirrored record is spread over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSet {
    /// Primary key column; also the upsert conflict target.
    pub id: String,
    /// Column holding the JSON payload.
    pub data: String,
    /// Column holding the last write time.
    pub timestamp: String,
    /// Column holding a write counter, if versioning is enabled.
    pub version: Option<String>,
}

impl ColumnSet {
    /// Sets the id column.
    pub fn with_id(mut self, column: impl Into<String>) -> Self {
        self.id = column.into();
        self
    }

    /// Sets the data column.
    pub fn with_data(mut self, column: impl Into<String>) -> Self {
        self.data = column.into();
        self
    }

    /// Sets the timestamp column.
    pub fn with_timestamp(mut self, column: impl Into<String>) -> Self {
        self.timestamp = column.into();
        self
    }

    /// Enables versioning on the given column.
    pub fn with_version(mut self, column: impl Into<String>) -> Self {
        self.version = Some(column.into());
        self
    }

    /// Returns true if writes carry a version counter.
    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Columns a read projects, in id/timestamp/data/version order.
    pub fn projection(&self) -> Vec<String> {
        let mut columns = vec![self.id.clone(), self.timestamp.clone(), self.data.clone()];
        if let Some(version) = &self.version {
            columns.push(version.clone());
        }
        columns
    }

    /// Extracts payload, timestamp and version from a row.
    ///
    /// Absent or null columns decode to `None`; a present column of the
    /// wrong type is an error.
    pub fn decode(&self, row: &Row) -> ProtocolResult<RecordState> {
        let data = match row.get(&self.data) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.clone()),
        };

        let timestamp = match row.get(&self.timestamp) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        ProtocolError::InvalidRecord(format!(
                            "column {} is not an RFC 3339 timestamp: {e}",
                            self.timestamp
                        ))
                    })?
                    .with_timezone(&Utc),
            ),
            Some(other) => {
                return Err(ProtocolError::InvalidRecord(format!(
                    "column {} holds {other}, expected a timestamp string",
                    self.timestamp
                )))
            }
        };

        let version = match self.version.as_ref().and_then(|column| row.get(column)) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| {
                ProtocolError::InvalidRecord(format!("version {value} is not an integer"))
            })?),
        };

        Ok(RecordState {
            data,
            timestamp,
            version,
        })
    }

    /// Builds the row written by an upsert.
    pub fn encode(
        &self,
        id: &Value,
        data: Value,
        timestamp: DateTime<Utc>,
        version: Option<i64>,
    ) -> Row {
        let mut row = Row::new();
        row.insert(self.id.clone(), id.clone());
        row.insert(self.data.clone(), data);
        row.insert(
            self.timestamp.clone(),
            Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        if let (Some(column), Some(version)) = (&self.version, version) {
            row.insert(column.clone(), Value::from(version));
        }
        row
    }
}

impl Default for ColumnSet {
    fn default() -> Self {
        Self {
            id: "id".into(),
            data: "data".into(),
            timestamp: "updated_at".into(),
            version: None,
        }
    }
}

/// Decoded contents of a single remote row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordState {
    /// The JSON payload, if any.
    pub data: Option<Value>,
    /// Last write time, if recorded.
    pub timestamp: Option<DateTime<Utc>>,
    /// Write counter, if versioned.
    pub version: Option<i64>,
}

/// Which rows a query or subscription targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    /// The single row whose id column equals `id`.
    Record {
        /// Id column name.
        column: String,
        /// Id value.
        id: Value,
    },
    /// Every row matching a filter expression.
    Filter(FilterExpr),
}

impl Selector {
    /// Selects the single row whose `column` equals `id`.
    pub fn record(column: impl Into<String>, id: Value) -> Self {
        Selector::Record {
            column: column.into(),
            id,
        }
    }

    /// Returns true if `row` is selected.
    ///
    /// Record ids compare the way an `eq` filter does, so the string id
    /// `"42"` selects a row whose id is the number `42`.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Selector::Record { column, id } => id_filter(column, id).matches(row),
            Selector::Filter(expr) => expr.matches(row),
        }
    }

    /// Renders the selector as a change-subscription filter string.
    pub fn channel_filter(&self) -> String {
        match self {
            Selector::Record { column, id } => id_filter(column, id).to_string(),
            Selector::Filter(expr) => expr.to_string(),
        }
    }
}

fn id_filter(column: &str, id: &Value) -> FilterExpr {
    match id {
        Value::String(s) => FilterExpr::eq(column, s),
        other => FilterExpr::eq(column, other),
    }
}

/// A column-projected read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Table to read.
    pub table: String,
    /// Columns to return.
    pub columns: Vec<String>,
    /// Row selection.
    pub selector: Selector,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl Query {
    /// Creates a query returning at most one row by id.
    pub fn record(
        table: impl Into<String>,
        columns: Vec<String>,
        id_column: &str,
        id: Value,
    ) -> Self {
        Self {
            table: table.into(),
            columns,
            selector: Selector::record(id_column, id),
            limit: Some(1),
        }
    }

    /// Creates an unbounded filtered query.
    pub fn filtered(table: impl Into<String>, columns: Vec<String>, filter: FilterExpr) -> Self {
        Self {
            table: table.into(),
            columns,
            selector: Selector::Filter(filter),
            limit: None,
        }
    }

    /// Copies only the projected columns out of `row`.
    pub fn project(&self, row: &Row) -> Row {
        self.columns
            .iter()
            .filter_map(|column| row.get(column).map(|v| (column.clone(), v.clone())))
            .collect()
    }
}

/// An insert-or-update keyed on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRecord {
    /// Target table.
    pub table: String,
    /// Column whose value decides insert versus update.
    pub conflict_column: String,
    /// Full row to write.
    pub row: Row,
    /// If set, an existing row is left untouched.
    pub ignore_duplicates: bool,
}

impl UpsertRecord {
    /// Creates an upsert that updates an existing row.
    pub fn new(table: impl Into<String>, conflict_column: impl Into<String>, row: Row) -> Self {
        Self {
            table: table.into(),
            conflict_column: conflict_column.into(),
            row,
            ignore_duplicates: false,
        }
    }

    /// Returns the conflict key value.
    pub fn key(&self) -> Option<&Value> {
        self.row.get(&self.conflict_column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn projection_order() {
        let columns = ColumnSet::default();
        assert_eq!(columns.projection(), vec!["id", "updated_at", "data"]);

        let columns = columns.with_version("version");
        assert_eq!(
            columns.projection(),
            vec!["id", "updated_at", "data", "version"]
        );
    }

    #[test]
    fn encode_then_decode_keeps_timestamp_exact() {
        let columns = ColumnSet::default().with_version("rev");
        let ts = now_timestamp();
        let encoded = columns.encode(&json!("a"), json!({"x": 1}), ts, Some(3));

        assert_eq!(encoded["id"], json!("a"));
        assert_eq!(encoded["rev"], json!(3));

        let state = columns.decode(&encoded).unwrap();
        assert_eq!(state.timestamp, Some(ts));
        assert_eq!(state.version, Some(3));
        assert_eq!(state.data, Some(json!({"x": 1})));
    }

    #[test]
    fn decode_treats_null_columns_as_absent() {
        let columns = ColumnSet::default().with_version("version");
        let state = columns
            .decode(&row(json!({"id": 1, "data": null, "updated_at": null, "version": 0})))
            .unwrap();
        assert_eq!(state.data, None);
        assert_eq!(state.timestamp, None);
        assert_eq!(state.version, Some(0));
    }

    #[test]
    fn decode_rejects_bad_column_types() {
        let columns = ColumnSet::default().with_version("version");
        assert!(columns
            .decode(&row(json!({"updated_at": 12})))
            .is_err());
        assert!(columns
            .decode(&row(json!({"updated_at": "yesterday"})))
            .is_err());
        assert!(columns.decode(&row(json!({"version": "one"}))).is_err());
    }

    #[test]
    fn record_query_is_bounded_to_one_row() {
        let query = Query::record("t", vec!["id".into()], "id", json!("k"));
        assert_eq!(query.limit, Some(1));
        assert!(query.selector.matches(&row(json!({"id": "k"}))));
        assert!(!query.selector.matches(&row(json!({"id": "other"}))));
    }

    #[test]
    fn channel_filter_strings() {
        let record = Selector::Record {
            column: "id".into(),
            id: json!("abc"),
        };
        assert_eq!(record.channel_filter(), "id=eq.abc");

        let numeric = Selector::Record {
            column: "id".into(),
            id: json!(12),
        };
        assert_eq!(numeric.channel_filter(), "id=eq.12");

        let filter = Selector::Filter(FilterExpr::parse("owner=eq.me").unwrap());
        assert_eq!(filter.channel_filter(), "owner=eq.me");
    }

    #[test]
    fn record_ids_match_across_string_and_number() {
        let from_path = Selector::record("id", json!("42"));
        assert!(from_path.matches(&row(json!({"id": 42}))));
        assert!(from_path.matches(&row(json!({"id": "42"}))));
        assert!(!from_path.matches(&row(json!({"id": 420}))));
        assert!(!from_path.matches(&row(json!({"other": 42}))));

        let numeric = Selector::record("id", json!(7));
        assert!(numeric.matches(&row(json!({"id": "7"}))));
        assert!(!numeric.matches(&row(json!({"id": "seven"}))));
    }

    #[test]
    fn project_keeps_only_listed_columns() {
        let query = Query::filtered(
            "t",
            vec!["id".into(), "data".into()],
            FilterExpr::parse("id=neq.0").unwrap(),
        );
        let projected = query.project(&row(json!({"id": 1, "data": {}, "secret": true})));
        assert_eq!(Value::Object(projected), json!({"id": 1, "data": {}}));
    }

    #[test]
    fn upsert_key() {
        let upsert = UpsertRecord::new("t", "id", row(json!({"id": 5, "data": {}})));
        assert_eq!(upsert.key(), Some(&json!(5)));
        assert!(!upsert.ignore_duplicates);
    }
}
