//! Bounded worker pools with FIFO task queues.
//!
//! The engine runs two pools: one for join work (which also executes the
//! source selection probes) and a smaller one for union work, so that
//! join tasks cannot starve the union workers that consume their output.
//! Tasks are futures tagged with the query they belong to; a task whose
//! query aborted between scheduling and dequeue is dropped without
//! running, notifying its control so latches still drain.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{FederationError, Result};
use crate::query::QueryInfo;

/// Callback handle a task reports to on completion, failure or skip.
pub trait TaskControl: Send + Sync + 'static {
    /// The task finished normally.
    fn done(&self);

    /// The task failed; the first error aborts the query.
    fn toss(&self, error: FederationError);

    /// The task was dropped before running because its query aborted.
    fn cancelled(&self) {
        self.done();
    }
}

struct ScheduledTask {
    query: Arc<QueryInfo>,
    future: BoxFuture<'static, ()>,
    on_skip: Option<Box<dyn FnOnce() + Send>>,
}

/// A fixed-size pool of workers pulling from a FIFO queue.
pub struct WorkerScheduler {
    name: &'static str,
    queue: Mutex<Option<mpsc::UnboundedSender<ScheduledTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerScheduler {
    pub fn new(name: &'static str, workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|index| {
                let rx = rx.clone();
                tokio::spawn(worker_loop(name, index, rx))
            })
            .collect();
        debug!(scheduler = name, workers, "scheduler started");
        Arc::new(WorkerScheduler {
            name,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            worker_count: workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Hand a task off to the pool. Never blocks; fails only after
    /// shutdown.
    pub fn schedule(
        &self,
        query: Arc<QueryInfo>,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.submit(ScheduledTask {
            query,
            future: Box::pin(future),
            on_skip: None,
        })
    }

    /// Schedule a fallible task reporting to `control`: `done()` on
    /// success, `toss()` on failure (which also records the error on the
    /// query and aborts it), `cancelled()` when skipped.
    pub fn schedule_with_control<C: TaskControl>(
        &self,
        query: Arc<QueryInfo>,
        control: Arc<C>,
        task: impl Future<Output = Result<()>> + Send + 'static,
    ) -> Result<()> {
        let skip_control = control.clone();
        let task_query = query.clone();
        self.submit(ScheduledTask {
            query,
            future: Box::pin(async move {
                match task.await {
                    Ok(()) => control.done(),
                    Err(error) => {
                        task_query.record_error(error.clone());
                        control.toss(error);
                    }
                }
            }),
            on_skip: Some(Box::new(move || skip_control.cancelled())),
        })
    }

    fn submit(&self, task: ScheduledTask) -> Result<()> {
        let queue = self.queue.lock();
        match queue.as_ref() {
            Some(tx) => tx.send(task).map_err(|_| self.shut_down_error()),
            None => Err(self.shut_down_error()),
        }
    }

    fn shut_down_error(&self) -> FederationError {
        FederationError::IllegalState(format!("{} scheduler is shut down", self.name))
    }

    /// Stop accepting tasks and abort the workers.
    pub fn shutdown(&self) {
        self.queue.lock().take();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        debug!(scheduler = self.name, "scheduler shut down");
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .finish()
    }
}

async fn worker_loop(
    name: &'static str,
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ScheduledTask>>>,
) {
    loop {
        // hold the queue lock only while waiting for the next task
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };
        if task.query.is_aborted() {
            trace!(
                scheduler = name,
                worker = index,
                query_id = task.query.query_id(),
                "dropping task of aborted query"
            );
            if let Some(on_skip) = task.on_skip {
                on_skip();
            }
            continue;
        }
        task.future.await;
    }
}

/// Counts task completions down to zero, with a deadline-bounded wait.
pub struct CountDownLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        CountDownLatch {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    pub fn count_down(&self) {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "latch counted below zero");
        if previous == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            // register interest before checking, so a concurrent
            // count_down cannot be lost
            let notified = self.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the latch drains; `false` when the deadline passes
    /// first.
    pub async fn wait_timeout(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn query() -> Arc<QueryInfo> {
        Arc::new(QueryInfo::new(1, "q", Duration::from_secs(30)))
    }

    struct CountingControl {
        done: AtomicUsize,
        tossed: AtomicUsize,
    }

    impl CountingControl {
        fn new() -> Arc<Self> {
            Arc::new(CountingControl {
                done: AtomicUsize::new(0),
                tossed: AtomicUsize::new(0),
            })
        }
    }

    impl TaskControl for CountingControl {
        fn done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }

        fn toss(&self, _error: FederationError) {
            self.tossed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn tasks_run_on_the_pool() {
        let scheduler = WorkerScheduler::new("test", 2);
        let latch = Arc::new(CountDownLatch::new(8));
        for _ in 0..8 {
            let latch = latch.clone();
            scheduler
                .schedule(query(), async move {
                    latch.count_down();
                })
                .unwrap();
        }
        assert!(latch.wait_timeout(Duration::from_secs(5)).await);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn aborted_query_tasks_are_skipped_but_notified() {
        let scheduler = WorkerScheduler::new("test", 1);
        let q = query();
        q.abort();
        let control = CountingControl::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = ran.clone();
        scheduler
            .schedule_with_control(q, control.clone(), async move {
                ran_in_task.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        // skip still reports to the control so latches drain
        assert_eq!(control.done.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn failing_task_aborts_the_query_and_tosses() {
        let scheduler = WorkerScheduler::new("test", 1);
        let q = query();
        let control = CountingControl::new();
        scheduler
            .schedule_with_control(q.clone(), control.clone(), async move {
                Err(FederationError::Optimization("boom".into()))
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(q.is_aborted());
        assert_eq!(control.tossed.load(Ordering::SeqCst), 1);
        assert!(matches!(q.error(), Some(FederationError::Optimization(_))));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn schedule_after_shutdown_fails() {
        let scheduler = WorkerScheduler::new("test", 1);
        scheduler.shutdown();
        let result = scheduler.schedule(query(), async {});
        assert!(matches!(result, Err(FederationError::IllegalState(_))));
    }

    #[tokio::test]
    async fn latch_timeout_reports_false() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)).await);
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(20)).await);
    }
}
