//! `/table/id` shorthand for naming a single remote record.

use crate::error::{ProtocolError, ProtocolResult};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| {
        Regex::new(r"^/?(?P<table>[\w_-]+?)/(?P<id>.+)$").unwrap_or_else(|e| {
            unreachable!("record path grammar is a valid regex: {e}")
        })
    })
}

/// A table name plus record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPath {
    /// Table name (word characters, underscores and hyphens).
    pub table: String,
    /// Record id: everything after the first separator.
    pub id: String,
}

impl RecordPath {
    /// Creates a path from its parts.
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Parses `table/id` or `/table/id`.
    ///
    /// The table match is non-greedy, so `/a/b/c` is table `a`, id `b/c`.
    pub fn parse(path: &str) -> ProtocolResult<Self> {
        let captures = grammar()
            .captures(path)
            .ok_or_else(|| ProtocolError::PathParse(path.to_string()))?;

        Ok(Self::new(&captures["table"], &captures["id"]))
    }
}

impl FromStr for RecordPath {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.table, self.id)
    }
}
