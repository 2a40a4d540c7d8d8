//! Tracking of the outstanding local write.

use crate::error::{SessionError, SessionResult};
use tokio::sync::watch;

/// Snapshot of the write pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStatus {
    /// A mutation burst was observed and has not reached the write path.
    pub queued: bool,
    /// The write path is running.
    pub in_flight: bool,
    /// Number of write-path runs that have finished.
    pub completed: u64,
    /// Failure of the most recent run, until taken.
    pub last_error: Option<SessionError>,
}

impl WriteStatus {
    /// Returns true when nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        !self.queued && !self.in_flight
    }
}

/// The at-most-one pending write of a session.
#[derive(Debug)]
pub struct PendingWrite {
    status: watch::Sender<WriteStatus>,
}

impl PendingWrite {
    /// Creates an idle tracker.
    pub fn new() -> Self {
        let (status, _) = watch::channel(WriteStatus::default());
        Self { status }
    }

    /// Current status.
    pub fn status(&self) -> WriteStatus {
        self.status.borrow().clone()
    }

    /// Records that a burst is waiting for the write path.
    pub fn mark_queued(&self) {
        self.status.send_if_modified(|s| !std::mem::replace(&mut s.queued, true));
    }

    /// Clears the queued mark when a debounce window closes without a write.
    pub fn clear_queued(&self) {
        self.status.send_if_modified(|s| std::mem::replace(&mut s.queued, false));
    }

    /// Marks the write path as running.
    pub fn begin(&self) {
        self.status.send_modify(|s| {
            s.queued = false;
            s.in_flight = true;
        });
    }

    /// Marks the write path as running until the returned guard is
    /// finished or dropped.
    ///
    /// A guard dropped without [`InFlight::finish`], for example while a
    /// panicking write unwinds, records [`SessionError::WriteAborted`] so
    /// waiters in [`settled`](Self::settled) are released.
    pub fn start(&self) -> InFlight<'_> {
        self.begin();
        InFlight {
            pending: self,
            finished: false,
        }
    }

    /// Marks the write path as finished with `result`.
    pub fn finish(&self, result: SessionResult<()>) {
        self.status.send_modify(|s| {
            s.in_flight = false;
            s.completed += 1;
            s.last_error = result.err();
        });
    }

    /// Takes the failure of the last finished run.
    pub fn take_error(&self) -> Option<SessionError> {
        let mut taken = None;
        self.status.send_if_modified(|s| {
            taken = s.last_error.take();
            taken.is_some()
        });
        taken
    }

    /// Waits until nothing is queued or running.
    pub async fn settled(&self) {
        let mut receiver = self.status.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(WriteStatus::is_idle).await;
    }
}

/// A running write, released on drop.
#[derive(Debug)]
#[must_use = "dropping the guard immediately aborts the write"]
pub struct InFlight<'a> {
    pending: &'a PendingWrite,
    finished: bool,
}

impl InFlight<'_> {
    /// Reports the outcome of the write.
    pub fn finish(mut self, result: SessionResult<()>) {
        self.finished = true;
        self.pending.finish(result);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pending.finish(Err(SessionError::WriteAborted));
        }
    }
}

impl Default for PendingWrite {
    fn default() -> Self {
        Self::new()
    }
}
