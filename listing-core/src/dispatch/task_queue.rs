//! ``src/dispatch/task_queue.rs``
//! ============================================================================
//! # Task Dispatcher: Per-Listing Serialization Point
//!
//! Every tree mutation passes through this FIFO queue. Any producer
//! (listener callback, timer tick, public API call) enqueues a task; if no
//! drain loop is active, the enqueuing context spawns one, which processes
//! tasks strictly in enqueue order until the queue is empty and then stops.
//! No dedicated always-running worker is kept.
//!
//! Guarantees: at most one task executes at a time per dispatcher; tasks
//! never overlap or reorder. The drain-active flag is per-listing state, not
//! a process-wide global.
//!
//! `close()` marks the dispatcher closed (further enqueues are discarded),
//! drops queued tasks, and cancels the abort token so a long-running task
//! can observe it at its checkpoints and unwind.

use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send + 'static>;

#[derive(Default)]
struct DispatcherInner {
    queue: Mutex<VecDeque<TaskFn>>,
    draining: AtomicBool,
    closed: AtomicBool,
    abort: CancellationToken,

    /// Queued plus currently running tasks.
    pending: AtomicUsize,
    idle: Notify,
}

/// Cheaply cloneable handle; all clones share one queue and one drain flag.
#[derive(Clone, Default)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("pending", &self.inner.pending.load(Ordering::Relaxed))
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Discarded silently when the dispatcher is closed.
    /// Starts a drain loop if none is active.
    pub fn enqueue<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("Dispatcher closed, task discarded");
            return;
        }

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        self.inner
            .queue
            .lock()
            .push_back(Box::new(move |token| Box::pin(task(token))));

        self.try_spawn_drain();
    }

    fn try_spawn_drain(&self) {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                Self::drain(&inner).await;
            });
        }
    }

    async fn drain(inner: &Arc<DispatcherInner>) {
        loop {
            let next = inner.queue.lock().pop_front();

            match next {
                Some(task) => {
                    trace!("Dispatcher running task");
                    task(inner.abort.clone()).await;

                    if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        inner.idle.notify_waiters();
                    }
                }

                None => {
                    inner.draining.store(false, Ordering::Release);

                    // A task may have slipped in between the pop and the
                    // flag reset; reclaim the drain if so.
                    if inner.queue.lock().is_empty() {
                        break;
                    }
                    if inner
                        .draining
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Close the dispatcher: reject future enqueues, drop queued tasks and
    /// signal the currently running task to abort at its next checkpoint.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.abort.cancel();

        let dropped = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };

        if dropped > 0 {
            debug!(dropped, "Dispatcher closed with queued tasks dropped");
            if self.inner.pending.fetch_sub(dropped, Ordering::AcqRel) == dropped {
                self.inner.idle.notify_waiters();
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Token observed by long-running tasks at their abort checkpoints.
    #[must_use]
    pub fn abort_token(&self) -> CancellationToken {
        self.inner.abort.clone()
    }

    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Resolve once no task is queued or running. The listing may only be
    /// destroyed after this.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_in_enqueue_order() {
        let dispatcher = TaskDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let log = Arc::clone(&log);
            dispatcher.enqueue(move |_token| async move {
                log.lock().push(i);
            });
        }

        dispatcher.wait_idle().await;
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn tasks_never_overlap() {
        let dispatcher = TaskDispatcher::new();
        let running = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU32::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let overlaps = Arc::clone(&overlaps);
            dispatcher.enqueue(move |_token| async move {
                if running.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.store(false, Ordering::SeqCst);
            });
        }

        dispatcher.wait_idle().await;
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_dispatcher_discards_enqueues() {
        let dispatcher = TaskDispatcher::new();
        dispatcher.close();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        dispatcher.enqueue(move |_token| async move {
            flag.store(true, Ordering::SeqCst);
        });

        dispatcher.wait_idle().await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn close_cancels_running_task_at_checkpoint() {
        let dispatcher = TaskDispatcher::new();
        let completed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&completed);
        dispatcher.enqueue(move |token| async move {
            for _ in 0..1000 {
                if token.is_cancelled() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.close();
        dispatcher.wait_idle().await;

        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_loop_restarts_after_going_idle() {
        let dispatcher = TaskDispatcher::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        dispatcher.enqueue(move |_token| async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.wait_idle().await;

        let c = Arc::clone(&counter);
        dispatcher.enqueue(move |_token| async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.wait_idle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
