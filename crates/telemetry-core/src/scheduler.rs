//! Bounded worker pool with a priority queue.
//!
//! Tasks wait in a max-heap ordered by priority, FIFO among equals. A fixed
//! number of workers each run one task at a time. A task finishes when its
//! handler calls [`Done::done`], not when the handler's future returns, so a
//! handler may hand completion off to other work. A handler that fails or
//! panics counts as done.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify};

use crate::error::SchedulerError;

/// Error a handler may return. Logged and otherwise treated as completion.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerFuture = BoxFuture<'static, Result<(), TaskError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Passed to the handler alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub worker_id: usize,
}

/// Runs one task.
pub trait TaskHandler<P>: Send + Sync + 'static {
    fn handle(&self, payload: P, done: Done, info: TaskInfo) -> HandlerFuture;
}

impl<P, F> TaskHandler<P> for F
where
    F: Fn(P, Done, TaskInfo) -> HandlerFuture + Send + Sync + 'static,
{
    fn handle(&self, payload: P, done: Done, info: TaskInfo) -> HandlerFuture {
        self(payload, done, info)
    }
}

struct DoneInner {
    sender: Mutex<Option<oneshot::Sender<()>>>,
    info: TaskInfo,
}

impl DoneInner {
    fn fire(&self) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Completion signal for one task. Clones share the same signal. If every
/// clone is dropped without signalling, the task completes anyway.
#[derive(Clone)]
pub struct Done {
    inner: Arc<DoneInner>,
}

impl Done {
    fn new(sender: oneshot::Sender<()>, info: TaskInfo) -> Self {
        Self {
            inner: Arc::new(DoneInner {
                sender: Mutex::new(Some(sender)),
                info,
            }),
        }
    }

    /// Signal completion. Returns false, with a warning, if the task was
    /// already done.
    pub fn done(&self) -> bool {
        let fired = self.inner.fire();
        if !fired {
            let TaskInfo { task_id, worker_id } = self.inner.info;
            tracing::warn!("done() called more than once for task {task_id} on worker {worker_id}");
        }
        fired
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done").field("info", &self.inner.info).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of workers.
    pub concurrency: usize,
    /// Maximum number of pending (not yet started) tasks.
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_size: 1000,
        }
    }
}

struct Queued<P> {
    priority: i32,
    seq: u64,
    id: TaskId,
    payload: P,
}

impl<P> PartialEq for Queued<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for Queued<P> {}

impl<P> PartialOrd for Queued<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Queued<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerSlot {
    current: Option<TaskId>,
    stopping: bool,
    stopped: bool,
}

impl WorkerSlot {
    fn available(&self) -> bool {
        self.current.is_none() && !self.stopping && !self.stopped
    }
}

struct State<P> {
    pending: BinaryHeap<Queued<P>>,
    workers: Vec<WorkerSlot>,
    next_id: u64,
    dispatch_scheduled: bool,
    stopped: bool,
}

struct Inner<P> {
    handler: Arc<dyn TaskHandler<P>>,
    max_size: usize,
    state: Mutex<State<P>>,
    changed: Notify,
}

impl<P: Send + 'static> Inner<P> {
    fn lock(&self) -> MutexGuard<'_, State<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand pending tasks to free workers.
    fn dispatch(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.lock();
            state.dispatch_scheduled = false;
            if state.stopped {
                return;
            }
            for worker_id in 0..state.workers.len() {
                if !state.workers[worker_id].available() {
                    continue;
                }
                let Some(task) = state.pending.pop() else {
                    break;
                };
                state.workers[worker_id].current = Some(task.id);
                started.push((worker_id, task));
            }
        }
        for (worker_id, task) in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run_worker(worker_id, task).await });
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, first: Queued<P>) {
        let mut task = first;
        loop {
            self.execute(worker_id, task).await;
            match self.finish_and_next(worker_id) {
                Some(next) => task = next,
                None => break,
            }
        }
        self.changed.notify_waiters();
    }

    async fn execute(&self, worker_id: usize, task: Queued<P>) {
        let info = TaskInfo {
            task_id: task.id,
            worker_id,
        };
        let (tx, rx) = oneshot::channel();
        let done = Done::new(tx, info);
        let weak = Arc::downgrade(&done.inner);
        let started = Instant::now();

        let handler = Arc::clone(&self.handler);
        let payload = task.payload;
        let call = std::panic::catch_unwind(AssertUnwindSafe(move || handler.handle(payload, done, info)));
        match call {
            Ok(future) => {
                tokio::spawn(supervise(future, weak, info, started));
            }
            Err(panic) => {
                tracing::error!(
                    "task {} panicked on worker {worker_id} after {:?}: {}",
                    info.task_id,
                    started.elapsed(),
                    panic_message(panic.as_ref())
                );
                complete_implicitly(&weak);
            }
        }

        if rx.await.is_err() {
            tracing::debug!(
                "task {} on worker {worker_id} finished without calling done()",
                info.task_id
            );
        }
        self.changed.notify_waiters();
    }

    /// Release the worker's slot and claim its next task, if it should run one.
    fn finish_and_next(&self, worker_id: usize) -> Option<Queued<P>> {
        let mut state = self.lock();
        let stopped = state.stopped;
        let slot = &mut state.workers[worker_id];
        slot.current = None;
        if slot.stopping {
            slot.stopping = false;
            slot.stopped = true;
            return None;
        }
        if stopped {
            return None;
        }
        let next = state.pending.pop()?;
        state.workers[worker_id].current = Some(next.id);
        Some(next)
    }
}

/// Await a handler's future, logging failures and completing the task on
/// its behalf when it failed before calling done.
async fn supervise(future: HandlerFuture, done: Weak<DoneInner>, info: TaskInfo, started: Instant) {
    let failure = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
    };
    if let Some(message) = failure {
        tracing::warn!(
            "task {} on worker {} failed after {:?}: {message}",
            info.task_id,
            info.worker_id,
            started.elapsed()
        );
        complete_implicitly(&done);
    }
}

fn complete_implicitly(done: &Weak<DoneInner>) {
    if let Some(inner) = done.upgrade() {
        inner.fire();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A priority task queue drained by a fixed pool of workers.
///
/// Must be used from within a Tokio runtime.
pub struct TaskQueue<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for TaskQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + 'static> TaskQueue<P> {
    pub fn new(config: QueueConfig, handler: impl TaskHandler<P>) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                handler: Arc::new(handler),
                max_size: config.max_size,
                state: Mutex::new(State {
                    pending: BinaryHeap::new(),
                    workers: vec![WorkerSlot::default(); concurrency],
                    next_id: 1,
                    dispatch_scheduled: false,
                    stopped: false,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Enqueue with default priority.
    pub fn push(&self, payload: P) -> Result<TaskId, SchedulerError> {
        self.push_with_priority(payload, 0)
    }

    /// Enqueue a task. Higher priorities run first. Several pushes in a row
    /// share one dispatch pass.
    pub fn push_with_priority(&self, payload: P, priority: i32) -> Result<TaskId, SchedulerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut state = self.inner.lock();
        if state.stopped {
            return Err(SchedulerError::Stopped);
        }
        if state.pending.len() >= self.inner.max_size {
            return Err(SchedulerError::QueueFull(self.inner.max_size));
        }
        let id = TaskId(state.next_id);
        state.next_id += 1;
        state.pending.push(Queued {
            priority,
            seq: id.0,
            id,
            payload,
        });
        if !state.dispatch_scheduled {
            state.dispatch_scheduled = true;
            drop(state);
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.dispatch() });
        }
        Ok(id)
    }

    /// Tasks waiting to start.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .workers
            .iter()
            .filter(|w| w.current.is_some())
            .count()
    }

    /// True when no worker is running a task. Pending tasks do not count:
    /// right after a push and before the dispatch tick the queue is idle.
    pub fn is_idle(&self) -> bool {
        self.inner.lock().workers.iter().all(|w| w.current.is_none())
    }

    async fn wait_until(&self, condition: impl Fn(&State<P>) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let ready = condition(&*self.inner.lock());
            if ready {
                return;
            }
            notified.await;
        }
    }

    /// Wait until nothing is running and nothing runnable is pending.
    pub async fn drain(&self) {
        self.wait_until(|state| {
            let idle = state.workers.iter().all(|w| w.current.is_none());
            let runnable = !state.stopped && state.workers.iter().any(WorkerSlot::available);
            idle && (state.pending.is_empty() || !runnable)
        })
        .await;
    }

    /// Stop dispatching and wait for running tasks to finish. Pending tasks
    /// are discarded and further pushes are rejected.
    pub async fn stop(&self) {
        let discarded = {
            let mut state = self.inner.lock();
            state.stopped = true;
            let count = state.pending.len();
            state.pending.clear();
            count
        };
        if discarded > 0 {
            tracing::info!("task queue stopping, {discarded} pending tasks discarded");
        }
        self.wait_until(|state| state.workers.iter().all(|w| w.current.is_none()))
            .await;
    }

    /// Stop one worker after its current task, waiting for that task.
    pub async fn stop_worker(&self, worker_id: usize) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.lock();
            let slot = state
                .workers
                .get_mut(worker_id)
                .ok_or(SchedulerError::WorkerNotFound(worker_id))?;
            if slot.current.is_some() {
                slot.stopping = true;
            } else {
                slot.stopped = true;
            }
        }
        self.wait_until(|state| state.workers[worker_id].current.is_none())
            .await;
        Ok(())
    }

    /// Put a stopped worker back into rotation.
    pub fn start_worker(&self, worker_id: usize) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.lock();
            let slot = state
                .workers
                .get_mut(worker_id)
                .ok_or(SchedulerError::WorkerNotFound(worker_id))?;
            slot.stopping = false;
            slot.stopped = false;
        }
        self.schedule_dispatch();
        Ok(())
    }

    fn schedule_dispatch(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut state = self.inner.lock();
        if state.dispatch_scheduled || state.pending.is_empty() {
            return;
        }
        state.dispatch_scheduled = true;
        drop(state);
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.dispatch() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn boxed<F>(f: F) -> HandlerFuture
    where
        F: std::future::Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Box::pin(f)
    }

    #[tokio::test]
    async fn test_concurrency_limit_and_completion() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler = {
            let running = running.clone();
            let peak = peak.clone();
            move |n: u32, done: Done, _info: TaskInfo| {
                let running = running.clone();
                let peak = peak.clone();
                let tx = tx.clone();
                boxed(async move {
                    let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    peak.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, AtomicOrdering::SeqCst);
                    let _ = tx.send(n);
                    done.done();
                    Ok(())
                })
            }
        };

        let queue = TaskQueue::new(QueueConfig { concurrency: 2, max_size: 10 }, handler);
        for n in 0..5 {
            queue.push(n).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("task completed in time")
                .expect("channel open");
            seen.push(n);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
        tokio::time::timeout(Duration::from_secs(5), queue.drain()).await.unwrap();
        assert!(queue.is_idle());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_two_workers_hold_five_tasks() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let handler = {
            let gate = gate.clone();
            move |_: u32, done: Done, _info: TaskInfo| {
                let gate = gate.clone();
                boxed(async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    done.done();
                    Ok(())
                })
            }
        };
        let queue = TaskQueue::new(QueueConfig { concurrency: 2, max_size: 10 }, handler);
        for n in 0..5 {
            queue.push(n).unwrap();
        }
        assert!(queue.is_idle());
        assert_eq!(queue.len(), 5);

        tokio::task::yield_now().await;
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.len(), 3);
        assert!(!queue.is_idle());

        gate.add_permits(4);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(queue.is_empty() && queue.in_flight() == 1) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(!queue.is_idle());

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), queue.drain()).await.unwrap();
        assert!(queue.is_idle());
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = TaskQueue::new(QueueConfig { concurrency: 1, max_size: 2 }, |_: u32, _done: Done, _info: TaskInfo| {
            boxed(async { Ok(()) })
        });
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.push(3), Err(SchedulerError::QueueFull(2)));
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(QueueConfig { concurrency: 1, max_size: 10 }, move |n: u32, done: Done, _info: TaskInfo| {
            let _ = tx.send(n);
            done.done();
            boxed(async { Ok(()) })
        });
        // Pushed before dispatch runs, so ordering is decided by the heap.
        queue.push_with_priority(1, 0).unwrap();
        queue.push_with_priority(2, 5).unwrap();
        queue.push_with_priority(3, 0).unwrap();
        queue.push_with_priority(4, 5).unwrap();
        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[tokio::test]
    async fn test_failed_handler_counts_as_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(QueueConfig { concurrency: 1, max_size: 10 }, move |n: u32, done: Done, _info: TaskInfo| {
            let tx = tx.clone();
            if n == 1 {
                panic!("synchronous failure");
            }
            boxed(async move {
                if n == 2 {
                    // keep a clone alive so only the error path can complete it
                    let keep = done.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        drop(keep);
                    });
                    return Err("async failure".into());
                }
                let _ = tx.send(n);
                done.done();
                Ok(())
            })
        });
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_done_twice_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(QueueConfig { concurrency: 1, max_size: 10 }, move |_: u32, done: Done, _info: TaskInfo| {
            let first = done.done();
            let second = done.done();
            let _ = tx.send((first, second));
            boxed(async { Ok(()) })
        });
        queue.push(1).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, (true, false));
    }

    #[tokio::test]
    async fn test_stop_and_stop_worker() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let queue = TaskQueue::new(QueueConfig { concurrency: 2, max_size: 10 }, move |n: u32, done: Done, info: TaskInfo| {
            let release_rx = release_rx.clone();
            let started_tx = started_tx.clone();
            boxed(async move {
                let _ = started_tx.send((n, info.worker_id));
                if n == 1 {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                }
                done.done();
                Ok(())
            })
        });

        assert_eq!(queue.stop_worker(7).await, Err(SchedulerError::WorkerNotFound(7)));

        queue.push(1).unwrap();
        let (_, busy_worker) = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.in_flight(), 1);

        let stopper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.stop_worker(busy_worker).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopper.is_finished());
        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), stopper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The remaining worker still runs tasks.
        queue.push(2).unwrap();
        let (n, worker) = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 2);
        assert_ne!(worker, busy_worker);

        tokio::time::timeout(Duration::from_secs(5), queue.stop()).await.unwrap();
        assert_eq!(queue.push(3), Err(SchedulerError::Stopped));
    }

    #[test]
    fn test_push_outside_runtime() {
        let queue = TaskQueue::new(QueueConfig::default(), |_: u32, _done: Done, _info: TaskInfo| {
            boxed(async { Ok(()) })
        });
        assert_eq!(queue.push(1), Err(SchedulerError::NoRuntime));
    }
}
