//! Conflict detection and resolution.

use crate::change::RemoteChange;
use crate::record::ColumnSet;
use chrono::{DateTime, Utc};

/// Freshness markers of one side of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stamp {
    /// Last write time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Write counter.
    pub version: Option<i64>,
}

impl Stamp {
    /// Creates a stamp.
    pub fn new(timestamp: Option<DateTime<Utc>>, version: Option<i64>) -> Self {
        Self { timestamp, version }
    }
}

/// A remote change meeting local state.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Local freshness at the time the change arrived.
    pub local: Stamp,
    /// Freshness carried by the remote change.
    pub remote: Stamp,
    /// Whether the change carries a payload to apply.
    pub has_payload: bool,
    /// Resolution (if any).
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    /// Creates a new conflict.
    pub fn new(local: Stamp, remote: Stamp, has_payload: bool) -> Self {
        Self {
            local,
            remote,
            has_payload,
            resolution: None,
        }
    }

    /// Creates a conflict between local state and a decoded change.
    pub fn from_change(local: Stamp, change: &RemoteChange) -> Self {
        Self::new(
            local,
            Stamp::new(change.timestamp, change.version),
            change.data.is_some(),
        )
    }

    /// Resolves the conflict with the given resolution.
    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Local state is at least as fresh; drop the change.
    KeepLocal,
    /// Replace local state with the remote payload.
    AcceptRemote,
    /// Nothing to apply.
    Skip,
}

/// Last-writer-wins policy, keyed on version or timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Accept only strictly higher version counters.
    HigherVersion,
    /// Accept only strictly later timestamps.
    LastWriteWins,
}

impl ConflictPolicy {
    /// Chooses the policy a column layout supports.
    pub fn for_columns(columns: &ColumnSet) -> Self {
        if columns.is_versioned() {
            ConflictPolicy::HigherVersion
        } else {
            ConflictPolicy::LastWriteWins
        }
    }

    /// Decides a conflict without recording the outcome.
    ///
    /// An unset local marker means nothing has been read or written yet, so
    /// any remote payload wins. A remote change missing the marker the
    /// policy compares on never wins.
    pub fn decide(&self, conflict: &Conflict) -> ConflictResolution {
        if !conflict.has_payload {
            return ConflictResolution::Skip;
        }

        let newer = match self {
            ConflictPolicy::HigherVersion => {
                match (conflict.local.version, conflict.remote.version) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(local), Some(remote)) => remote > local,
                }
            }
            ConflictPolicy::LastWriteWins => {
                match (conflict.local.timestamp, conflict.remote.timestamp) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(local), Some(remote)) => remote > local,
                }
            }
        };

        if newer {
            ConflictResolution::AcceptRemote
        } else {
            ConflictResolution::KeepLocal
        }
    }

    /// Resolves a conflict according to this policy.
    pub fn resolve(&self, conflict: &mut Conflict) -> ConflictResolution {
        let resolution = self.decide(conflict);
        conflict.resolve(resolution);
        resolution
    }
}
