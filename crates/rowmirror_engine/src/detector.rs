//! Local change detection.
//!
//! The detector observes a [`LiveTree`](crate::LiveTree) through an
//! [`Observable`] runtime and turns mutation batches into calls of a burst
//! handler. Batches arriving while the write lock is held are discarded.
//! Accepted batches mark the session's pending write as queued and are
//! forwarded to a worker task, which either invokes the handler once per
//! delivered batch or debounces them according to a [`ThrottleConfig`].
//!
//! Handler runs are spawned as their own tasks, so [`ChangeDetector::unwatch`]
//! never cancels a write that has already started.

use crate::config::ThrottleConfig;
use crate::lock::WriteLock;
use crate::observable::{MutationBatch, Observable, Observer, SharedTree};
use crate::pending::PendingWrite;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{trace, warn};

/// Future returned by a burst handler.
pub type BurstFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked once per settled burst of local mutations.
pub type BurstHandler = Arc<dyn Fn() -> BurstFuture + Send + Sync>;

/// A registered local change observer.
pub struct ChangeDetector {
    active: Arc<AtomicBool>,
    observer: Observer,
    worker: JoinHandle<()>,
    pending: Arc<PendingWrite>,
}

impl ChangeDetector {
    /// Starts observing `tree`.
    pub fn watch(
        runtime: &dyn Observable,
        tree: &SharedTree,
        lock: Arc<WriteLock>,
        pending: Arc<PendingWrite>,
        throttle: Option<ThrottleConfig>,
        handler: BurstHandler,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel::<MutationBatch>();

        let callback_active = Arc::clone(&active);
        let callback_pending = Arc::clone(&pending);
        let observer = runtime.observe(
            tree,
            Arc::new(move |batch: MutationBatch| {
                if !callback_active.load(Ordering::SeqCst) {
                    return;
                }
                if lock.is_updating() {
                    trace!(
                        first = batch.first,
                        last = batch.last,
                        "ignoring mutations during update"
                    );
                    return;
                }
                callback_pending.mark_queued();
                if tx.send(batch).is_err() {
                    callback_pending.clear_queued();
                }
            }),
        );

        let worker_pending = Arc::clone(&pending);
        let worker = tokio::spawn(async move {
            match throttle {
                Some(throttle) => debounce(rx, throttle, worker_pending, handler).await,
                None => direct(rx, handler).await,
            }
        });

        Self {
            active,
            observer,
            worker,
            pending,
        }
    }

    /// Returns true until [`unwatch`](Self::unwatch) is called.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops observing. Bursts not yet handed to the handler are dropped.
    pub fn unwatch(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.observer.cancel();
            self.worker.abort();
            self.pending.clear_queued();
        }
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("active", &self.is_active())
            .finish()
    }
}

async fn run(handler: &BurstHandler) {
    if let Err(e) = tokio::spawn(handler()).await {
        warn!(error = %e, "local write task failed");
    }
}

async fn direct(mut rx: mpsc::UnboundedReceiver<MutationBatch>, handler: BurstHandler) {
    while let Some(batch) = rx.recv().await {
        let mut count = batch.count;
        while let Ok(extra) = rx.try_recv() {
            count += extra.count;
        }
        trace!(mutations = count, "local burst");
        run(&handler).await;
    }
}

/// Debounces batches with leading/trailing edges and an optional ceiling.
async fn debounce(
    mut rx: mpsc::UnboundedReceiver<MutationBatch>,
    throttle: ThrottleConfig,
    pending: Arc<PendingWrite>,
    handler: BurstHandler,
) {
    while rx.recv().await.is_some() {
        let start = Instant::now();
        let max_deadline = throttle.max_wait.map(|max| start + max);
        let mut deadline = start + throttle.wait;
        let mut trailing_call = true;

        if throttle.leading {
            run(&handler).await;
            trailing_call = false;
        }

        loop {
            let fire_at = max_deadline.map_or(deadline, |max| max.min(deadline));
            tokio::select! {
                next = rx.recv() => match next {
                    Some(_) => {
                        trailing_call = true;
                        deadline = Instant::now() + throttle.wait;
                    }
                    None => return,
                },
                _ = sleep_until(fire_at) => break,
            }
        }

        if throttle.trailing && trailing_call {
            run(&handler).await;
        } else {
            pending.clear_queued();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::TokioObservable;
    use rowmirror_protocol::TreeValue;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        tree: SharedTree,
        lock: Arc<WriteLock>,
        pending: Arc<PendingWrite>,
        calls: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                tree: TokioObservable.create(TreeValue::object()),
                lock: Arc::new(WriteLock::new()),
                pending: Arc::new(PendingWrite::new()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn watch(&self, throttle: Option<ThrottleConfig>) -> ChangeDetector {
            let calls = Arc::clone(&self.calls);
            let pending = Arc::clone(&self.pending);
            let handler: BurstHandler = Arc::new(move || -> BurstFuture {
                let calls = Arc::clone(&calls);
                let pending = Arc::clone(&pending);
                Box::pin(async move {
                    pending.begin();
                    calls.fetch_add(1, Ordering::SeqCst);
                    pending.finish(Ok(()));
                })
            });
            ChangeDetector::watch(
                &TokioObservable,
                &self.tree,
                Arc::clone(&self.lock),
                Arc::clone(&self.pending),
                throttle,
                handler,
            )
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test]
    async fn direct_mode_runs_once_per_batch() {
        let h = Harness::new();
        let _detector = h.watch(None);

        h.tree.insert("a", 1i64).unwrap();
        h.tree.insert("b", 2i64).unwrap();
        settle(20).await;
        assert_eq!(h.calls(), 1);

        h.tree.insert("c", 3i64).unwrap();
        settle(20).await;
        assert_eq!(h.calls(), 2);
        assert!(h.pending.status().is_idle());
    }

    #[tokio::test]
    async fn mutations_under_the_lock_are_ignored() {
        let h = Harness::new();
        let _detector = h.watch(None);

        let guard = h.lock.try_acquire().unwrap();
        h.tree.insert("a", 1i64).unwrap();
        settle(20).await;
        drop(guard);

        assert_eq!(h.calls(), 0);
        assert!(h.pending.status().is_idle());
    }

    #[tokio::test]
    async fn debounce_collapses_a_burst() {
        let h = Harness::new();
        let _detector = h.watch(Some(ThrottleConfig::new(Duration::from_millis(40))));

        for i in 0..5i64 {
            h.tree.insert(format!("k{i}"), i).unwrap();
            settle(10).await;
        }
        assert_eq!(h.calls(), 0);
        assert!(!h.pending.status().is_idle());

        settle(80).await;
        assert_eq!(h.calls(), 1);
        assert!(h.pending.status().is_idle());
    }

    #[tokio::test]
    async fn leading_edge_runs_immediately() {
        let h = Harness::new();
        let throttle = ThrottleConfig::new(Duration::from_millis(40))
            .with_leading(true)
            .with_trailing(false);
        let _detector = h.watch(Some(throttle));

        h.tree.insert("a", 1i64).unwrap();
        settle(10).await;
        assert_eq!(h.calls(), 1);

        h.tree.insert("b", 2i64).unwrap();
        settle(80).await;
        assert_eq!(h.calls(), 1);
        assert!(h.pending.status().is_idle());
    }

    #[tokio::test]
    async fn max_wait_bounds_a_continuous_burst() {
        let h = Harness::new();
        let throttle = ThrottleConfig::new(Duration::from_millis(30))
            .with_max_wait(Duration::from_millis(60));
        let _detector = h.watch(Some(throttle));

        for i in 0..12i64 {
            h.tree.insert("k", i).unwrap();
            settle(10).await;
        }
        assert!(h.calls() >= 1);
    }

    #[tokio::test]
    async fn unwatch_stops_delivery() {
        let h = Harness::new();
        let detector = h.watch(None);
        assert_eq!(h.tree.observer_count(), 1);

        detector.unwatch();
        h.tree.insert("a", 1i64).unwrap();
        settle(20).await;

        assert_eq!(h.calls(), 0);
        assert!(h.pending.status().is_idle());
    }
}
