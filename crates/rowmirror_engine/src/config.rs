//! Configuration for a sync session.

use crate::error::{SessionError, SessionResult};
use crate::observable::Observable;
use crate::store::RemoteStore;
use rowmirror_protocol::{ColumnSet, FilterExpr, RecordPath, Selector};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving a plain snapshot.
pub type Hook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Observability callbacks. None of them can affect sync behavior.
#[derive(Clone, Default)]
pub struct SessionHooks {
    /// Fired with the snapshot of the first successful read.
    pub on_init: Option<Hook>,
    /// Fired with the snapshot of later reads and accepted remote changes.
    pub on_read: Option<Hook>,
    /// Fired with the snapshot about to be written upstream.
    pub on_change: Option<Hook>,
    /// Fired with the final snapshot when the session is destroyed.
    pub on_destroy: Option<Hook>,
}

impl SessionHooks {
    /// Sets the first-read hook.
    pub fn with_on_init(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_init = Some(Arc::new(hook));
        self
    }

    /// Sets the read hook.
    pub fn with_on_read(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_read = Some(Arc::new(hook));
        self
    }

    /// Sets the local-change hook.
    pub fn with_on_change(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(hook));
        self
    }

    /// Sets the destroy hook.
    pub fn with_on_destroy(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_destroy = Some(Arc::new(hook));
        self
    }

    pub(crate) fn fire(hook: &Option<Hook>, snapshot: &Value) {
        if let Some(hook) = hook {
            hook(snapshot);
        }
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("on_init", &self.on_init.is_some())
            .field("on_read", &self.on_read.is_some())
            .field("on_change", &self.on_change.is_some())
            .field("on_destroy", &self.on_destroy.is_some())
            .finish()
    }
}

/// Debounce settings for local change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Quiet period that closes a burst.
    pub wait: Duration,
    /// Longest a burst may defer the write, if bounded.
    pub max_wait: Option<Duration>,
    /// Write on the first mutation of a burst.
    pub leading: bool,
    /// Write after the burst goes quiet.
    pub trailing: bool,
}

impl ThrottleConfig {
    /// Creates a trailing-edge debounce.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            max_wait: None,
            leading: false,
            trailing: true,
        }
    }

    /// Bounds how long a continuous burst can defer a write.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Sets leading-edge invocation.
    pub fn with_leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Sets trailing-edge invocation.
    pub fn with_trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Which remote rows a session mirrors.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// One row, by id.
    Record {
        /// Record id.
        id: Value,
    },
    /// Every row matching a filter.
    Filter(FilterExpr),
}

/// Configuration for one sync session.
///
/// Built once per session and never mutated afterwards.
#[derive(Clone)]
pub struct SessionConfig {
    /// Remote table.
    pub table: String,
    /// Rows to mirror.
    pub target: Target,
    /// Mirror rows as an array of `{id, ...data}` instead of one object.
    pub is_array: bool,
    /// Read the remote state during `init`.
    pub read: bool,
    /// Watch the local tree during `init`.
    pub watch: bool,
    /// Push detected local changes upstream.
    pub write: bool,
    /// Subscribe to remote changes during `init`.
    pub subscribe: bool,
    /// Return session controls alongside the data from `init`.
    pub attach_handles: bool,
    /// Debounce for local change bursts; `None` writes on every batch.
    pub throttle: Option<ThrottleConfig>,
    /// Column layout of the remote table.
    pub columns: ColumnSet,
    /// Observability callbacks.
    pub hooks: SessionHooks,
    /// Log rejected remote changes.
    pub debug: bool,
    /// How long the write lock outlives a state replacement.
    pub settle_delay: Duration,
    /// Extra wait applied by `flush` after the pending write settles.
    pub flush_delay: Duration,
    /// Remote store handle.
    pub store: Option<Arc<dyn RemoteStore>>,
    /// Observation runtime; the tokio runtime is used when unset.
    pub runtime: Option<Arc<dyn Observable>>,
}

impl SessionConfig {
    /// Creates a configuration mirroring a single record.
    pub fn record(table: impl Into<String>, id: impl Into<Value>) -> Self {
        Self::with_target(table.into(), Target::Record { id: id.into() }, false)
    }

    /// Creates a configuration mirroring every row matching `filter`.
    pub fn filtered(table: impl Into<String>, filter: FilterExpr) -> Self {
        Self::with_target(table.into(), Target::Filter(filter), true)
    }

    /// Creates a single-record configuration from `/table/id`.
    pub fn from_path(path: &str) -> SessionResult<Self> {
        let path = RecordPath::parse(path)?;
        Ok(Self::record(path.table, path.id))
    }

    fn with_target(table: String, target: Target, is_array: bool) -> Self {
        Self {
            table,
            target,
            is_array,
            read: true,
            watch: true,
            write: true,
            subscribe: true,
            attach_handles: true,
            throttle: None,
            columns: ColumnSet::default(),
            hooks: SessionHooks::default(),
            debug: false,
            settle_delay: Duration::from_millis(1000),
            flush_delay: Duration::from_millis(100),
            store: None,
            runtime: None,
        }
    }

    /// Sets the remote store.
    pub fn with_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the observation runtime.
    pub fn with_runtime(mut self, runtime: Arc<dyn Observable>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets array mode.
    pub fn with_array(mut self, is_array: bool) -> Self {
        self.is_array = is_array;
        self
    }

    /// Enables or disables the initial read.
    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    /// Enables or disables local change watching at init.
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Enables or disables upstream writes.
    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Enables or disables the remote subscription at init.
    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    /// Controls whether `init` hands back session controls.
    pub fn with_attach_handles(mut self, attach: bool) -> Self {
        self.attach_handles = attach;
        self
    }

    /// Sets the local change debounce.
    pub fn with_throttle(mut self, throttle: Option<ThrottleConfig>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the column layout.
    pub fn with_columns(mut self, columns: ColumnSet) -> Self {
        self.columns = columns;
        self
    }

    /// Sets the callbacks.
    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Enables logging of rejected remote changes.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the write-lock settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the default flush delay.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Row selection for reads and subscriptions.
    pub fn selector(&self) -> Selector {
        match &self.target {
            Target::Record { id } => Selector::Record {
                column: self.columns.id.clone(),
                id: id.clone(),
            },
            Target::Filter(expr) => Selector::Filter(expr.clone()),
        }
    }

    /// Checks the settings `init` depends on.
    pub fn validate(&self) -> SessionResult<()> {
        if self.store.is_none() {
            return Err(SessionError::Configuration(
                "a remote store handle is required".into(),
            ));
        }
        if self.table.is_empty() {
            return Err(SessionError::Configuration("table name is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("table", &self.table)
            .field("target", &self.target)
            .field("is_array", &self.is_array)
            .field("read", &self.read)
            .field("watch", &self.watch)
            .field("write", &self.write)
            .field("subscribe", &self.subscribe)
            .field("attach_handles", &self.attach_handles)
            .field("throttle", &self.throttle)
            .field("columns", &self.columns)
            .field("hooks", &self.hooks)
            .field("debug", &self.debug)
            .field("settle_delay", &self.settle_delay)
            .field("flush_delay", &self.flush_delay)
            .field("store", &self.store.is_some())
            .finish()
    }
}
