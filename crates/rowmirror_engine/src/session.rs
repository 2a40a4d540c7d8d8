//! Sync session: the façade tying a live tree to a remote record.

use crate::config::{Hook, SessionConfig, SessionHooks};
use crate::detector::{BurstFuture, BurstHandler, ChangeDetector};
use crate::error::{SessionError, SessionResult};
use crate::gateway::{ChannelHandle, RemoteGateway};
use crate::lock::WriteLock;
use crate::observable::{Observable, SharedTree, TokioObservable};
use crate::pending::PendingWrite;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rowmirror_protocol::{
    now_timestamp, Conflict, ConflictPolicy, ConflictResolution, RemoteChange, Row, Stamp,
    TreeValue,
};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `init` not yet called.
    Idle,
    /// Performing the initial read.
    Reading,
    /// Registering the local change detector.
    Watching,
    /// Opening the remote change channel.
    Subscribing,
    /// Initialized and syncing.
    Ready,
    /// Torn down.
    Destroyed,
}

impl SessionState {
    /// Returns true while `init` is in progress.
    pub fn is_initializing(&self) -> bool {
        matches!(
            self,
            SessionState::Reading | SessionState::Watching | SessionState::Subscribing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters describing what a session has done.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Successful reads.
    pub reads: u64,
    /// Confirmed local writes.
    pub local_writes: u64,
    /// Remote changes applied locally.
    pub remote_accepted: u64,
    /// Remote changes dropped as stale.
    pub remote_rejected: u64,
    /// Remote changes without a payload.
    pub remote_ignored: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Point-in-time view of a session's sync metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMeta {
    /// Time of the last applied or written state.
    pub timestamp: Option<DateTime<Utc>>,
    /// Write counter of the last applied or written state.
    pub version: Option<i64>,
    /// Whether the write lock is held.
    pub is_updating: bool,
    /// Whether local changes are being observed.
    pub watching: bool,
    /// Whether a remote change channel is open.
    pub subscribed: bool,
}

/// Options for [`SyncSession::read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Merge the remote state instead of replacing local state, keeping
    /// local keys the remote does not have.
    pub force: bool,
}

/// Options for [`SyncSession::set`].
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    /// Hold the write lock while applying.
    pub mark_updating: bool,
    /// Lock hold time after the scheduling quantum; the session's settle
    /// delay when unset.
    pub settle_delay: Option<Duration>,
    /// Delete local keys absent from the snapshot.
    pub remove_keys: bool,
    /// New local timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// New local version.
    pub version: Option<i64>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            mark_updating: true,
            settle_delay: None,
            remove_keys: true,
            timestamp: None,
            version: None,
        }
    }
}

/// The result of [`SyncSession::init`]: plain data plus optional controls.
#[derive(Debug, Clone)]
pub struct Mirror {
    /// The live local tree.
    pub data: SharedTree,
    /// Session operations, present when `attach_handles` is set.
    pub controls: Option<SyncSession>,
}

/// Creates a session from `config` and initializes it.
pub async fn init(config: SessionConfig) -> SessionResult<Mirror> {
    SyncSession::new(config).init().await
}

/// A bidirectional sync between a [`LiveTree`](crate::LiveTree) and remote
/// rows.
///
/// Cloning is cheap and yields another handle to the same session. Once
/// initialized, the session's background tasks keep it alive until
/// [`destroy`](Self::destroy) is called, even if every handle is dropped.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    runtime: Arc<dyn Observable>,
    gateway: Option<RemoteGateway>,
    tree: SharedTree,
    lock: Arc<WriteLock>,
    pending: Arc<PendingWrite>,
    stamp: Mutex<Stamp>,
    state: RwLock<SessionState>,
    stats: Mutex<SessionStats>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    detector: Mutex<Option<ChangeDetector>>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
    subscribed: AtomicBool,
}

impl SyncSession {
    /// Creates an uninitialized session.
    ///
    /// The configuration is checked by [`init`](Self::init).
    pub fn new(config: SessionConfig) -> Self {
        let runtime = config
            .runtime
            .clone()
            .unwrap_or_else(|| Arc::new(TokioObservable));
        let root = if config.is_array {
            TreeValue::Array(Vec::new())
        } else {
            TreeValue::object()
        };
        let tree = runtime.create(root);
        let gateway = RemoteGateway::new(&config).ok();

        Self {
            inner: Arc::new(SessionInner {
                config,
                runtime,
                gateway,
                tree,
                lock: Arc::new(WriteLock::new()),
                pending: Arc::new(PendingWrite::new()),
                stamp: Mutex::new(Stamp::default()),
                state: RwLock::new(SessionState::Idle),
                stats: Mutex::new(SessionStats::default()),
                initialized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                detector: Mutex::new(None),
                channel: tokio::sync::Mutex::new(None),
                subscribed: AtomicBool::new(false),
            }),
        }
    }

    /// Reads, watches and subscribes, as configured.
    ///
    /// Fails with a configuration error when no store is set, and with a
    /// reentrancy error when called again after succeeding. A failed init
    /// leaves the session idle and may be retried.
    pub async fn init(&self) -> SessionResult<Mirror> {
        let inner = &self.inner;
        inner.config.validate()?;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Reentrancy("init called twice on one session"));
        }

        if let Err(err) = self.start().await {
            warn!(table = %inner.config.table, error = %err, "session init failed");
            self.abandon_init().await;
            return Err(err);
        }
        info!(table = %inner.config.table, target = ?inner.config.target, "session ready");

        Ok(Mirror {
            data: Arc::clone(&inner.tree),
            controls: inner.config.attach_handles.then(|| self.clone()),
        })
    }

    async fn start(&self) -> SessionResult<()> {
        let inner = &self.inner;
        if inner.config.read {
            inner.transition(SessionState::Reading)?;
            self.read(ReadOptions::default()).await?;
        }
        if inner.config.watch {
            inner.transition(SessionState::Watching)?;
            self.watch(true)?;
        }
        if inner.config.subscribe {
            inner.transition(SessionState::Subscribing)?;
            self.subscribe(true).await?;
        }
        inner.transition(SessionState::Ready)
    }

    /// Undoes a partial init so it can be retried.
    async fn abandon_init(&self) {
        let inner = &self.inner;
        let _ = self.watch(false);
        if let Err(err) = self.subscribe(false).await {
            warn!(table = %inner.config.table, error = %err, "failed to close channel");
        }
        {
            let mut state = inner.state.write();
            if *state != SessionState::Destroyed {
                *state = SessionState::Idle;
            }
        }
        inner.initialized.store(false, Ordering::SeqCst);
    }

    /// Replaces local state with the remote state.
    ///
    /// Returns the snapshot that was applied.
    pub async fn read(&self, options: ReadOptions) -> SessionResult<Value> {
        let inner = &self.inner;
        let (snapshot, remote) = inner.fetch_state().await?;

        let first = inner.stamp.lock().version.is_none();
        let hooks = &inner.config.hooks;
        inner.fire(if first { &hooks.on_init } else { &hooks.on_read }, &snapshot);

        inner
            .set(
                TreeValue::from(snapshot.clone()),
                SetOptions {
                    remove_keys: !options.force,
                    timestamp: remote.timestamp,
                    version: Some(remote.version.unwrap_or(0)),
                    ..SetOptions::default()
                },
            )
            .await?;

        inner.stats.lock().reads += 1;
        debug!(table = %inner.config.table, version = ?remote.version, "read applied");
        Ok(snapshot)
    }

    /// Returns the remote state without touching local state.
    pub async fn fetch(&self) -> SessionResult<Value> {
        let (snapshot, _) = self.inner.fetch_state().await?;
        Ok(snapshot)
    }

    /// Waits for the pending write to settle, plus the configured delay.
    ///
    /// Reports the failure of the last write, if it failed.
    pub async fn flush(&self) -> SessionResult<()> {
        self.flush_with(self.inner.config.flush_delay).await
    }

    /// Like [`flush`](Self::flush), with an explicit delay.
    pub async fn flush_with(&self, delay: Duration) -> SessionResult<()> {
        let pending = &self.inner.pending;
        tokio::task::yield_now().await;
        pending.settled().await;
        tokio::time::sleep(delay).await;
        pending.settled().await;
        match pending.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Starts or stops observing local changes. Repeating the current
    /// setting does nothing.
    pub fn watch(&self, enable: bool) -> SessionResult<()> {
        let inner = &self.inner;
        let mut slot = inner.detector.lock();
        match (enable, slot.is_some()) {
            (true, false) => {
                if inner.destroyed.load(Ordering::SeqCst) {
                    return Err(inner.destroyed_error("watch"));
                }
                let session = Arc::clone(inner);
                let handler: BurstHandler = Arc::new(move || -> BurstFuture {
                    let session = Arc::clone(&session);
                    Box::pin(async move { session.on_local_change().await })
                });
                *slot = Some(ChangeDetector::watch(
                    inner.runtime.as_ref(),
                    &inner.tree,
                    Arc::clone(&inner.lock),
                    Arc::clone(&inner.pending),
                    inner.config.throttle,
                    handler,
                ));
                debug!(table = %inner.config.table, "watching local changes");
            }
            (false, true) => {
                if let Some(detector) = slot.take() {
                    detector.unwatch();
                }
                debug!(table = %inner.config.table, "stopped watching local changes");
            }
            _ => {}
        }
        Ok(())
    }

    /// Opens or closes the remote change channel. Repeating the current
    /// setting does nothing.
    pub async fn subscribe(&self, enable: bool) -> SessionResult<()> {
        let inner = &self.inner;
        let mut slot = inner.channel.lock().await;
        match (enable, slot.take()) {
            (true, Some(handle)) => *slot = Some(handle),
            (true, None) => {
                if inner.destroyed.load(Ordering::SeqCst) {
                    return Err(inner.destroyed_error("subscribe"));
                }
                let session = Arc::clone(inner);
                let handle = inner
                    .gateway()?
                    .subscribe(move |change| {
                        let session = Arc::clone(&session);
                        async move { session.on_remote_change(change).await }
                    })
                    .await?;
                *slot = Some(handle);
                inner.subscribed.store(true, Ordering::SeqCst);
            }
            (false, Some(handle)) => {
                if let Err(err) = inner.gateway()?.unsubscribe(&handle).await {
                    *slot = Some(handle);
                    return Err(err);
                }
                inner.subscribed.store(false, Ordering::SeqCst);
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// Tears the session down.
    ///
    /// Fires `on_destroy`, then stops watching and unsubscribes
    /// concurrently. A write already in flight is left to finish; call
    /// [`flush`](Self::flush) first for a clean shutdown. No hook fires
    /// afterwards. Destroying twice is an error.
    pub async fn destroy(&self) -> SessionResult<()> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return Err(inner.destroyed_error("destroy"));
        }
        SessionHooks::fire(&inner.config.hooks.on_destroy, &inner.tree.to_plain());

        let (watched, subscribed) =
            tokio::join!(async { self.watch(false) }, self.subscribe(false));
        *inner.state.write() = SessionState::Destroyed;
        info!(table = %inner.config.table, "session destroyed");
        watched.and(subscribed)
    }

    /// Replaces local state with `snapshot`.
    ///
    /// With `mark_updating`, the write lock is held until one scheduling
    /// quantum and the settle delay have both passed, so the replacement is
    /// not mistaken for a local edit. Fails with a reentrancy error if the
    /// lock is already held.
    pub async fn set(
        &self,
        snapshot: impl Into<TreeValue>,
        options: SetOptions,
    ) -> SessionResult<()> {
        self.inner.set(snapshot.into(), options).await
    }

    /// The live local tree.
    pub fn data(&self) -> SharedTree {
        Arc::clone(&self.inner.tree)
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Current statistics.
    pub fn stats(&self) -> SessionStats {
        self.inner.stats.lock().clone()
    }

    /// Current sync metadata.
    pub fn meta(&self) -> SessionMeta {
        let inner = &self.inner;
        let stamp = *inner.stamp.lock();
        SessionMeta {
            timestamp: stamp.timestamp,
            version: stamp.version,
            is_updating: inner.lock.is_updating(),
            watching: inner.detector.lock().is_some(),
            subscribed: inner.subscribed.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("table", &self.inner.config.table)
            .field("target", &self.inner.config.target)
            .field("state", &self.state())
            .field("meta", &self.meta())
            .finish()
    }
}

impl SessionInner {
    fn gateway(&self) -> SessionResult<&RemoteGateway> {
        self.gateway.as_ref().ok_or_else(|| {
            SessionError::Configuration("a remote store handle is required".into())
        })
    }

    fn transition(&self, to: SessionState) -> SessionResult<()> {
        let mut state = self.state.write();
        if *state == SessionState::Destroyed {
            return Err(SessionError::InvalidStateTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %*state, to = %to, "session state");
        *state = to;
        Ok(())
    }

    fn destroyed_error(&self, operation: &str) -> SessionError {
        SessionError::InvalidStateTransition {
            from: SessionState::Destroyed.to_string(),
            to: operation.to_string(),
        }
    }

    /// Fires a hook unless the session is destroyed.
    fn fire(&self, hook: &Option<Hook>, snapshot: &Value) {
        if !self.destroyed.load(Ordering::SeqCst) {
            SessionHooks::fire(hook, snapshot);
        }
    }

    fn record_error(&self, err: &SessionError) {
        self.stats.lock().last_error = Some(err.to_string());
    }

    /// Reads the remote rows and derives a snapshot and its freshness.
    ///
    /// Array sessions map each row to `{id, ...data}` and take the highest
    /// timestamp and version across rows.
    async fn fetch_state(&self) -> SessionResult<(Value, Stamp)> {
        let rows = self.gateway()?.read().await?;
        let columns = &self.config.columns;

        if self.config.is_array {
            let mut items = Vec::with_capacity(rows.len());
            let mut stamp = Stamp::default();
            for row in &rows {
                let state = columns.decode(row)?;
                stamp.timestamp = stamp.timestamp.max(state.timestamp);
                stamp.version = stamp.version.max(state.version);
                items.push(self.array_item(row.get(&columns.id).cloned(), state.data));
            }
            return Ok((Value::Array(items), stamp));
        }

        let Some(row) = rows.first() else {
            return Ok((Value::Object(Map::new()), Stamp::default()));
        };
        let state = columns.decode(row)?;
        let snapshot = state.data.unwrap_or_else(|| Value::Object(Map::new()));
        Ok((snapshot, Stamp::new(state.timestamp, state.version)))
    }

    fn array_item(&self, id: Option<Value>, data: Option<Value>) -> Value {
        let mut item = Row::new();
        item.insert("id".into(), id.unwrap_or(Value::Null));
        if let Some(Value::Object(fields)) = data {
            item.extend(fields);
        }
        Value::Object(item)
    }

    async fn set(&self, snapshot: TreeValue, options: SetOptions) -> SessionResult<()> {
        let guard = if options.mark_updating {
            let guard = self
                .lock
                .try_acquire()
                .ok_or(SessionError::Reentrancy("state replacement while already updating"))?;
            Some(guard)
        } else {
            None
        };

        self.tree.assign(snapshot, options.remove_keys)?;
        {
            let mut stamp = self.stamp.lock();
            if options.timestamp.is_some() {
                stamp.timestamp = options.timestamp;
            }
            if options.version.is_some() {
                stamp.version = options.version;
            }
        }

        if guard.is_some() {
            tokio::task::yield_now().await;
            tokio::time::sleep(options.settle_delay.unwrap_or(self.config.settle_delay)).await;
        }
        drop(guard);
        Ok(())
    }

    async fn on_local_change(&self) {
        let write = self.pending.start();
        let result = self.write_local().await;
        if let Err(err) = &result {
            warn!(table = %self.config.table, error = %err, "local write failed");
            self.record_error(err);
        }
        write.finish(result);
    }

    async fn write_local(&self) -> SessionResult<()> {
        if self.lock.is_updating() {
            return Ok(());
        }
        let snapshot = self.tree.to_plain();
        let timestamp = now_timestamp();
        if self.config.is_array || self.tree.is_array() {
            return Err(SessionError::UnsupportedOperation(
                "writing back an array session",
            ));
        }

        self.fire(&self.config.hooks.on_change, &snapshot);
        if !self.config.write {
            return Ok(());
        }
        let gateway = self.gateway()?;

        let versioned = self.config.columns.is_versioned();
        let (previous, optimistic) = {
            let mut stamp = self.stamp.lock();
            let previous = *stamp;
            if versioned {
                let current = stamp.version.unwrap_or(0);
                let next = current
                    .checked_add(1)
                    .ok_or(SessionError::VersionOverflow(current))?;
                stamp.version = Some(next);
            }
            stamp.timestamp = Some(timestamp);
            (previous, *stamp)
        };

        let version = if versioned { optimistic.version } else { None };
        match gateway.upsert(snapshot, timestamp, version).await {
            Ok(_) => {
                self.stats.lock().local_writes += 1;
                debug!(table = %self.config.table, version = ?version, "local write confirmed");
                Ok(())
            }
            Err(err) => {
                // Undo the optimistic advance unless something newer landed.
                let mut stamp = self.stamp.lock();
                if *stamp == optimistic {
                    *stamp = previous;
                }
                Err(err)
            }
        }
    }

    async fn on_remote_change(&self, change: RemoteChange) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let policy = ConflictPolicy::for_columns(&self.config.columns);
        let local = *self.stamp.lock();
        let mut conflict = Conflict::from_change(local, &change);

        match policy.resolve(&mut conflict) {
            ConflictResolution::Skip => {
                self.stats.lock().remote_ignored += 1;
            }
            ConflictResolution::KeepLocal => {
                self.stats.lock().remote_rejected += 1;
                if self.config.debug {
                    debug!(
                        table = %self.config.table,
                        local_version = ?local.version,
                        remote_version = ?change.version,
                        local_timestamp = ?local.timestamp,
                        remote_timestamp = ?change.timestamp,
                        "rejected stale remote change"
                    );
                }
            }
            ConflictResolution::AcceptRemote => match self.apply_remote(change).await {
                Ok(()) => self.stats.lock().remote_accepted += 1,
                Err(err) => {
                    warn!(
                        table = %self.config.table,
                        error = %err,
                        "failed to apply remote change"
                    );
                    self.record_error(&err);
                }
            },
        }
    }

    async fn apply_remote(&self, change: RemoteChange) -> SessionResult<()> {
        let Some(data) = change.data else {
            return Ok(());
        };
        let snapshot = if self.config.is_array {
            self.merge_into_array(change.id, data)
        } else {
            data
        };

        self.set(
            TreeValue::from(snapshot.clone()),
            SetOptions {
                timestamp: change.timestamp,
                version: change.version,
                ..SetOptions::default()
            },
        )
        .await?;
        self.fire(&self.config.hooks.on_read, &snapshot);
        Ok(())
    }

    /// Replaces the matching row of the local array, or appends it.
    fn merge_into_array(&self, id: Option<Value>, data: Value) -> Value {
        let item = self.array_item(id, Some(data));
        let mut items = match self.tree.to_plain() {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        match items.iter_mut().find(|existing| existing.get("id") == item.get("id")) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
        Value::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use rowmirror_protocol::{ColumnSet, FilterExpr};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn quick(config: SessionConfig, store: &Arc<MemoryStore>) -> SessionConfig {
        config
            .with_store(store.clone())
            .with_settle_delay(Duration::from_millis(5))
            .with_flush_delay(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn missing_store_is_a_configuration_error() {
        let session = SyncSession::new(SessionConfig::record("t", "a"));
        let err = session.init().await.unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn state_walks_through_init() {
        let store = Arc::new(MemoryStore::new());
        let session = SyncSession::new(quick(SessionConfig::record("t", "a"), &store));
        assert_eq!(session.state(), SessionState::Idle);

        let mirror = session.init().await.unwrap();
        assert!(mirror.controls.is_some());
        assert_eq!(session.state(), SessionState::Ready);

        let meta = session.meta();
        assert!(meta.watching && meta.subscribed && !meta.is_updating);
        assert_eq!(meta.version, Some(0));
    }

    #[tokio::test]
    async fn set_refuses_to_nest() {
        let store = Arc::new(MemoryStore::new());
        let session = SyncSession::new(quick(SessionConfig::record("t", "a"), &store));

        let slow = SetOptions {
            settle_delay: Some(Duration::from_millis(50)),
            ..SetOptions::default()
        };
        let first = session.set(json!({"a": 1}), slow);
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.set(json!({"b": 2}), SetOptions::default()).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::Reentrancy(_))));
        assert_eq!(session.data().to_plain(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn set_without_marking_leaves_the_lock_alone() {
        let store = Arc::new(MemoryStore::new());
        let session = SyncSession::new(quick(SessionConfig::record("t", "a"), &store));
        let options = SetOptions {
            mark_updating: false,
            version: Some(7),
            ..SetOptions::default()
        };
        session.set(json!({"x": true}), options).await.unwrap();
        assert_eq!(session.meta().version, Some(7));
        assert!(!session.meta().is_updating);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_optimistic_meta() {
        let store = Arc::new(MemoryStore::new());
        let columns = ColumnSet::default().with_version("version");
        let session = SyncSession::new(
            quick(SessionConfig::record("t", "a"), &store)
                .with_columns(columns)
                .with_subscribe(false),
        );
        let mirror = session.init().await.unwrap();
        assert_eq!(session.meta().version, Some(0));

        store.set_connected(false);
        mirror.data.insert("k", "v").unwrap();
        let err = session.flush().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.meta().version, Some(0));
        assert_eq!(session.meta().timestamp, None);
        assert!(session.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn exhausted_version_fails_the_write_without_wedging() {
        let store = Arc::new(MemoryStore::new());
        store.seed("t", [row(json!({"id": "a", "data": {}, "version": i64::MAX}))]);
        let columns = ColumnSet::default().with_version("version");
        let config = quick(SessionConfig::record("t", "a"), &store).with_columns(columns);
        let session = SyncSession::new(config);
        let mirror = session.init().await.unwrap();

        mirror.data.insert("k", "v").unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), session.flush())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, SessionError::VersionOverflow(i64::MAX));
        assert_eq!(session.meta().version, Some(i64::MAX));
        assert_eq!(store.upsert_count(), 0);

        // The pipeline stays usable.
        mirror.data.insert("k2", "v").unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), session.flush())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failed_init_can_be_retried() {
        let store = Arc::new(MemoryStore::new());
        store.seed("t", [row(json!({"id": "a", "data": {"x": 1}}))]);
        let session = SyncSession::new(quick(SessionConfig::record("t", "a"), &store));

        store.set_connected(false);
        let err = session.init().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.meta().version, None);

        store.set_connected(true);
        let mirror = session.init().await.unwrap();
        assert_eq!(mirror.data.to_plain(), json!({"x": 1}));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(store.subscription_count(), 1);
        assert!(matches!(
            session.init().await,
            Err(SessionError::Reentrancy(_))
        ));
    }

    #[tokio::test]
    async fn failed_subscribe_during_init_stops_watching() {
        let store = Arc::new(MemoryStore::new());
        let config = quick(SessionConfig::record("t", "a"), &store).with_read(false);
        let session = SyncSession::new(config);

        store.set_connected(false);
        assert!(session.init().await.is_err());
        let meta = session.meta();
        assert!(!meta.watching && !meta.subscribed);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn refused_unsubscribe_keeps_the_channel() {
        let store = Arc::new(MemoryStore::new());
        let session = SyncSession::new(quick(SessionConfig::record("t", "a"), &store));
        session.init().await.unwrap();

        store.set_connected(false);
        assert!(session.subscribe(false).await.is_err());
        assert!(session.meta().subscribed);
        assert_eq!(store.subscription_count(), 1);

        store.set_connected(true);
        session.subscribe(false).await.unwrap();
        assert!(!session.meta().subscribed);
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn array_sessions_read_but_do_not_write() {
        let store = Arc::new(MemoryStore::new());
        let columns = ColumnSet::default().with_version("version");
        store.seed(
            "todos",
            [
                row(json!({"id": 1, "owner": "ann", "data": {"t": "a"}, "version": 2})),
                row(json!({"id": 2, "owner": "bob", "data": {"t": "b"}, "version": 9})),
                row(json!({"id": 3, "owner": "ann", "data": {"t": "c"}, "version": 4})),
            ],
        );
        let config = SessionConfig::filtered("todos", FilterExpr::parse("owner=eq.ann").unwrap())
            .with_columns(columns);
        let session = SyncSession::new(quick(config, &store));
        let mirror = session.init().await.unwrap();

        assert_eq!(
            mirror.data.to_plain(),
            json!([{"id": 1, "t": "a"}, {"id": 3, "t": "c"}])
        );
        assert_eq!(session.meta().version, Some(4));

        mirror.data.push(json!({"id": 4})).unwrap();
        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedOperation(_)));
        assert_eq!(store.upsert_count(), 0);
    }

    #[tokio::test]
    async fn destroy_twice_fails() {
        let store = Arc::new(MemoryStore::new());
        let session = SyncSession::new(quick(SessionConfig::record("t", "a"), &store));
        session.init().await.unwrap();

        session.destroy().await.unwrap();
        assert_eq!(session.state(), SessionState::Destroyed);
        assert!(matches!(
            session.destroy().await,
            Err(SessionError::InvalidStateTransition { .. })
        ));
        assert!(session.watch(true).is_err());
    }
}
