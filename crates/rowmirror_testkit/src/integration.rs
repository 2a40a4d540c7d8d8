//! Multi-session test helpers.
//!
//! Provides a harness running two sessions on the same record, for
//! convergence and echo-suppression checks.

use crate::fixtures::{start_session, StoreFixture};
use rowmirror_engine::{Mirror, SessionResult, SyncSession};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Two sessions mirroring the same record.
pub struct SessionPair {
    /// Store shared by both sessions.
    pub fixture: StoreFixture,
    /// First session.
    pub a: (SyncSession, Mirror),
    /// Second session.
    pub b: (SyncSession, Mirror),
}

impl SessionPair {
    /// Starts two sessions on `id`.
    pub async fn start(fixture: StoreFixture, id: &str) -> Self {
        let a = start_session(fixture.config(id)).await;
        let b = start_session(fixture.config(id)).await;
        Self { fixture, a, b }
    }

    /// Flushes both sessions.
    pub async fn flush(&self) -> SessionResult<()> {
        self.a.0.flush().await?;
        self.b.0.flush().await
    }

    /// Local snapshots of both sessions.
    pub fn snapshots(&self) -> (Value, Value) {
        (self.a.1.data.to_plain(), self.b.1.data.to_plain())
    }

    /// Returns true if both sessions and the store agree.
    pub async fn converged(&self) -> SessionResult<bool> {
        let remote = self.a.0.fetch().await?;
        let (a, b) = self.snapshots();
        Ok(a == b && a == remote)
    }

    /// Destroys both sessions.
    pub async fn destroy(&self) -> SessionResult<()> {
        self.a.0.destroy().await?;
        self.b.0.destroy().await
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
