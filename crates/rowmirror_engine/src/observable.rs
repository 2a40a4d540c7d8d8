//! Observable local trees.
//!
//! A [`LiveTree`] is the user-facing mutable mirror. Every mutation bumps a
//! sequence number and is broadcast to observers. An [`Observable`] runtime
//! turns that stream into batched callbacks: the default
//! [`TokioObservable`] waits one scheduling quantum after the first
//! mutation, drains whatever else arrived, and fires the callback once.

use parking_lot::RwLock;
use rowmirror_protocol::{
    is_reserved_key, to_plain, ProtocolError, ProtocolResult, TreeValue,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

/// Notification capacity per tree; slower observers see a lagged batch.
const MUTATION_CHANNEL_CAPACITY: usize = 256;

/// A tree shared between the caller and its session.
pub type SharedTree = Arc<LiveTree>;

/// Callback fired once per batch of mutations.
pub type BatchCallback = Arc<dyn Fn(MutationBatch) + Send + Sync>;

/// A single committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    /// Tree-local sequence number, starting at 1.
    pub sequence: u64,
}

/// Mutations delivered together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationBatch {
    /// First sequence in the batch.
    pub first: u64,
    /// Last sequence in the batch.
    pub last: u64,
    /// Number of notifications received.
    pub count: usize,
    /// Whether notifications were dropped because the observer fell behind.
    pub lagged: bool,
}

impl MutationBatch {
    fn empty() -> Self {
        Self {
            first: 0,
            last: 0,
            count: 0,
            lagged: false,
        }
    }

    fn push(&mut self, mutation: Mutation) {
        if self.count == 0 {
            self.first = mutation.sequence;
        }
        self.last = mutation.sequence;
        self.count += 1;
    }
}

/// A mutable JSON-like tree whose mutations can be observed.
///
/// The root is an object for single-record sessions and an array for
/// multi-record ones. Keyed writes refuse reserved-marker keys.
pub struct LiveTree {
    root: RwLock<TreeValue>,
    sequence: AtomicU64,
    notifier: broadcast::Sender<Mutation>,
}

impl LiveTree {
    /// Creates a tree. Non-container roots are replaced by an empty object.
    pub fn new(initial: TreeValue) -> Self {
        let root = if initial.is_container() {
            initial
        } else {
            TreeValue::object()
        };
        let (notifier, _) = broadcast::channel(MUTATION_CHANNEL_CAPACITY);
        Self {
            root: RwLock::new(root),
            sequence: AtomicU64::new(0),
            notifier,
        }
    }

    /// Deep-copies the current contents.
    pub fn snapshot(&self) -> TreeValue {
        self.root.read().clone()
    }

    /// Serializes the current contents into plain JSON.
    pub fn to_plain(&self) -> Value {
        to_plain(&self.root.read())
    }

    /// Returns a copy of one top-level child.
    pub fn get(&self, key: &str) -> Option<TreeValue> {
        self.root.read().get(key).cloned()
    }

    /// Returns true if the root is an array.
    pub fn is_array(&self) -> bool {
        matches!(*self.root.read(), TreeValue::Array(_))
    }

    /// Number of top-level keys or elements.
    pub fn len(&self) -> usize {
        match &*self.root.read() {
            TreeValue::Object(map) => map.len(),
            TreeValue::Array(items) => items.len(),
            _ => 0,
        }
    }

    /// Returns true if the root has no children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-level keys of an object root, in order.
    pub fn keys(&self) -> Vec<String> {
        self.root
            .read()
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sets a top-level key, returning the previous value.
    pub fn insert(
        &self,
        key: impl Into<String>,
        value: impl Into<TreeValue>,
    ) -> ProtocolResult<Option<TreeValue>> {
        let key = key.into();
        if is_reserved_key(&key) {
            return Err(ProtocolError::ReservedKey(key));
        }
        let previous = {
            let mut root = self.root.write();
            let found = root.kind();
            let map = root.as_object_mut().ok_or(ProtocolError::NotAContainer {
                expected: "object",
                found,
            })?;
            map.insert(key, value.into())
        };
        self.notify();
        Ok(previous)
    }

    /// Removes a top-level key.
    pub fn remove(&self, key: &str) -> ProtocolResult<Option<TreeValue>> {
        let previous = {
            let mut root = self.root.write();
            let found = root.kind();
            let map = root.as_object_mut().ok_or(ProtocolError::NotAContainer {
                expected: "object",
                found,
            })?;
            map.remove(key)
        };
        if previous.is_some() {
            self.notify();
        }
        Ok(previous)
    }

    /// Appends to an array root.
    pub fn push(&self, value: impl Into<TreeValue>) -> ProtocolResult<()> {
        {
            let mut root = self.root.write();
            let found = root.kind();
            let items = root.as_array_mut().ok_or(ProtocolError::NotAContainer {
                expected: "array",
                found,
            })?;
            items.push(value.into());
        }
        self.notify();
        Ok(())
    }

    /// Applies an arbitrary in-place edit as one mutation.
    pub fn update<R>(&self, edit: impl FnOnce(&mut TreeValue) -> R) -> R {
        let result = edit(&mut self.root.write());
        self.notify();
        result
    }

    /// Copies every entry of `snapshot` onto the root.
    ///
    /// Objects assign by key (reserved keys skipped), arrays by index. With
    /// `remove_missing`, keys absent from the snapshot are deleted and
    /// arrays are truncated to its length, so the tree ends up equal to the
    /// snapshot; otherwise extra local entries survive. A snapshot of the
    /// other container kind replaces the root only with `remove_missing`.
    pub fn assign(&self, snapshot: TreeValue, remove_missing: bool) -> ProtocolResult<()> {
        {
            let mut root = self.root.write();
            match (&mut *root, snapshot) {
                (TreeValue::Object(current), TreeValue::Object(incoming)) => {
                    if remove_missing {
                        current.retain(|key, _| incoming.contains_key(key));
                    }
                    for (key, value) in incoming {
                        if !is_reserved_key(&key) {
                            current.insert(key, value);
                        }
                    }
                }
                (TreeValue::Array(current), TreeValue::Array(incoming)) => {
                    let len = incoming.len();
                    for (index, value) in incoming.into_iter().enumerate() {
                        match current.get_mut(index) {
                            Some(slot) => *slot = value,
                            None => current.push(value),
                        }
                    }
                    if remove_missing {
                        current.truncate(len);
                    }
                }
                (current, incoming) if remove_missing && incoming.is_container() => {
                    *current = incoming;
                }
                (current, incoming) => {
                    return Err(ProtocolError::NotAContainer {
                        expected: current.kind(),
                        found: incoming.kind(),
                    });
                }
            }
        }
        self.notify();
        Ok(())
    }

    /// Subscribes to raw mutation notifications.
    pub fn mutations(&self) -> broadcast::Receiver<Mutation> {
        self.notifier.subscribe()
    }

    /// Number of live mutation receivers.
    pub fn observer_count(&self) -> usize {
        self.notifier.receiver_count()
    }

    /// Sequence number of the latest mutation.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn notify(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        // No receivers is fine: nobody is watching yet.
        let _ = self.notifier.send(Mutation { sequence });
    }
}

impl std::fmt::Debug for LiveTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTree")
            .field("root", &*self.root.read())
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// A runtime that makes trees observable.
pub trait Observable: Send + Sync {
    /// Wraps a plain tree so its mutations can be observed.
    fn create(&self, initial: TreeValue) -> SharedTree;

    /// Registers `callback` for batched mutation notifications.
    ///
    /// Dropping or cancelling the returned [`Observer`] stops delivery.
    fn observe(&self, tree: &SharedTree, callback: BatchCallback) -> Observer;
}

/// Registration handle returned by [`Observable::observe`].
pub struct Observer {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Observer {
    /// Creates a handle from an activity flag and its delivery task.
    pub fn new(active: Arc<AtomicBool>, task: Option<JoinHandle<()>>) -> Self {
        Self { active, task }
    }

    /// Returns true until the observer is cancelled.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops delivery. Batches already being assembled are discarded.
    pub fn cancel(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Observation runtime backed by tokio tasks.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioObservable;

impl Observable for TokioObservable {
    fn create(&self, initial: TreeValue) -> SharedTree {
        Arc::new(LiveTree::new(initial))
    }

    fn observe(&self, tree: &SharedTree, callback: BatchCallback) -> Observer {
        let mut receiver = tree.mutations();
        let active = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&active);

        let task = tokio::spawn(async move {
            loop {
                let mut batch = match receiver.recv().await {
                    Ok(mutation) => {
                        let mut batch = MutationBatch::empty();
                        batch.push(mutation);
                        batch
                    }
                    Err(RecvError::Lagged(_)) => MutationBatch {
                        lagged: true,
                        ..MutationBatch::empty()
                    },
                    Err(RecvError::Closed) => break,
                };

                // Let the rest of the burst land before delivering.
                tokio::task::yield_now().await;
                loop {
                    match receiver.try_recv() {
                        Ok(mutation) => batch.push(mutation),
                        Err(TryRecvError::Lagged(_)) => batch.lagged = true,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }

                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                callback(batch);
            }
        });

        Observer::new(active, Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn object(value: Value) -> TreeValue {
        TreeValue::from(value)
    }

    #[test]
    fn insert_rejects_reserved_keys() {
        let tree = LiveTree::new(TreeValue::object());
        assert!(matches!(
            tree.insert("$set", 1i64),
            Err(ProtocolError::ReservedKey(_))
        ));
        assert!(matches!(
            tree.insert("_meta", 1i64),
            Err(ProtocolError::ReservedKey(_))
        ));
        assert!(tree.is_empty());
        assert_eq!(tree.sequence(), 0);
    }

    #[test]
    fn keyed_writes_need_an_object_root() {
        let tree = LiveTree::new(TreeValue::Array(vec![]));
        assert!(tree.insert("a", 1i64).is_err());
        tree.push(json!({"id": 1})).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.is_array());
    }

    #[test]
    fn assign_full_replace_and_patch() {
        let tree = LiveTree::new(object(json!({"a": 1, "b": 2})));

        tree.assign(object(json!({"b": 3, "c": 4})), false).unwrap();
        assert_eq!(tree.to_plain(), json!({"a": 1, "b": 3, "c": 4}));

        tree.assign(object(json!({"c": 5})), true).unwrap();
        assert_eq!(tree.to_plain(), json!({"c": 5}));
        assert_eq!(tree.keys(), vec!["c".to_string()]);
    }

    #[test]
    fn assign_skips_reserved_keys() {
        let tree = LiveTree::new(TreeValue::object());
        tree.assign(object(json!({"_secret": 1, "$x": 2, "ok": 3})), true)
            .unwrap();
        assert_eq!(tree.keys(), vec!["ok".to_string()]);
    }

    #[test]
    fn assign_arrays_by_index() {
        let tree = LiveTree::new(object(json!([1, 2, 3])));

        tree.assign(object(json!([9])), false).unwrap();
        assert_eq!(tree.to_plain(), json!([9, 2, 3]));

        tree.assign(object(json!([7, 8])), true).unwrap();
        assert_eq!(tree.to_plain(), json!([7, 8]));
    }

    #[test]
    fn assign_kind_mismatch() {
        let tree = LiveTree::new(object(json!({"a": 1})));
        assert!(tree.assign(object(json!([1])), false).is_err());
        assert!(tree.assign(object(json!("scalar")), true).is_err());

        tree.assign(object(json!([1])), true).unwrap();
        assert!(tree.is_array());
    }

    #[test]
    fn every_mutation_bumps_the_sequence() {
        let tree = LiveTree::new(TreeValue::object());
        tree.insert("a", 1i64).unwrap();
        tree.remove("a").unwrap();
        tree.remove("missing").unwrap();
        tree.update(|root| root.as_object_mut().map(|m| m.clear()));
        assert_eq!(tree.sequence(), 3);
    }

    #[tokio::test]
    async fn observer_receives_one_batch_per_burst() {
        let runtime = TokioObservable;
        let tree = runtime.create(TreeValue::object());
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let _observer = runtime.observe(&tree, Arc::new(move |batch| sink.lock().push(batch)));
        assert_eq!(tree.observer_count(), 1);

        tree.insert("a", 1i64).unwrap();
        tree.insert("b", 2i64).unwrap();
        tree.insert("c", 3i64).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].count, 3);
        assert_eq!((batches[0].first, batches[0].last), (1, 3));
    }

    #[tokio::test]
    async fn cancelled_observer_stays_silent() {
        let runtime = TokioObservable;
        let tree = runtime.create(TreeValue::object());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let mut observer = runtime.observe(
            &tree,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tree.insert("a", 1i64).unwrap();
        observer.cancel();
        assert!(!observer.is_active());
        tree.insert("b", 2i64).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
