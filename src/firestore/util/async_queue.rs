//! A single-worker FIFO scheduler.
//!
//! Every operation is sent over one unbounded channel to one consumer task,
//! which awaits each operation to completion before receiving the next. Code
//! that only touches its state from inside enqueued operations therefore
//! needs no further locking.
//!
//! An operation that fails (or panics) poisons the queue: the error is
//! logged and recorded, operations already queued are skipped with that
//! error, and every later `enqueue` fails immediately.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::platform::runtime;
use crate::util::assert::hard_assert;

/// Identifies the kind of a delayed operation so tests can fast-forward
/// specific timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in `run_all_delayed_operations_until`.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    TransactionRetry,
    AsyncQueueRetry,
}

type Job = BoxFuture<'static, ()>;
type RetryableOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// Handle to a cooperative operation queue. Clones share the same queue.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<Inner>,
}

/// Non-owning handle, held by collaborators the queue itself owns.
#[derive(Clone)]
pub(crate) struct WeakAsyncQueue {
    inner: Weak<Inner>,
}

struct Inner {
    sender: Sender<Job>,
    state: Mutex<QueueState>,
    operation_in_progress: AtomicBool,
    pending_jobs: AtomicUsize,
    next_delayed_id: AtomicU64,
    retry_backoff: Mutex<ExponentialBackoff>,
}

#[derive(Default)]
struct QueueState {
    failure: Option<FirestoreError>,
    is_shutting_down: bool,
    skip_non_restricted_tasks: bool,
    delayed_operations: Vec<DelayedEntry>,
    timer_ids_to_skip: Vec<TimerId>,
    retryable_ops: VecDeque<RetryableOp>,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    handle: Arc<dyn DelayedHandle>,
}

trait DelayedHandle: Send + Sync {
    fn skip_delay(self: Arc<Self>);
}

enum Gate {
    Run,
    Failed(FirestoreError),
    Purged,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            sender,
            state: Mutex::new(QueueState::default()),
            operation_in_progress: AtomicBool::new(false),
            pending_jobs: AtomicUsize::new(0),
            next_delayed_id: AtomicU64::new(1),
            retry_backoff: Mutex::new(ExponentialBackoff::new(
                WeakAsyncQueue {
                    inner: weak.clone(),
                },
                TimerId::AsyncQueueRetry,
            )),
        });
        start_worker(receiver);
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> WeakAsyncQueue {
        WeakAsyncQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().unwrap().is_shutting_down
    }

    /// The error that poisoned the queue, if any.
    pub fn failure(&self) -> Option<FirestoreError> {
        self.inner.state.lock().unwrap().failure.clone()
    }

    /// Queues `op` and returns its result.
    ///
    /// Once the queue is restricted the returned future never resolves.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> BoxFuture<'static, FirestoreResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if let Err(err) = self.verify_not_failed() {
            return future::ready(Err(err)).boxed();
        }
        if self.is_shutting_down() {
            return future::pending().boxed();
        }
        self.enqueue_internal(op, false)
    }

    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if let Err(err) = self.verify_not_failed() {
            log::error!(target: "firestore", "{err}");
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        drop(self.enqueue_internal(op, false));
    }

    /// Queues `op` even after `enter_restricted_mode`. Used for teardown.
    pub fn enqueue_even_while_restricted<F, Fut, T>(
        &self,
        op: F,
    ) -> BoxFuture<'static, FirestoreResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if let Err(err) = self.verify_not_failed() {
            return future::ready(Err(err)).boxed();
        }
        self.enqueue_internal(op, true)
    }

    pub fn enqueue_and_forget_even_while_restricted<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        drop(self.enqueue_even_while_restricted(op));
    }

    /// Stops accepting regular operations. With `purge_existing_tasks`,
    /// regular operations that are already queued are dropped unrun.
    pub fn enter_restricted_mode(&self, purge_existing_tasks: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.is_shutting_down {
            state.is_shutting_down = true;
            state.skip_non_restricted_tasks = purge_existing_tasks;
        }
    }

    /// Queues an idempotent operation on the retry lane.
    ///
    /// The head of the lane is re-run with backoff for as long as it fails
    /// with a storage transaction error. Any other error poisons the queue.
    pub fn enqueue_retryable<F, Fut>(&self, op: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let op: RetryableOp = Arc::new(move || op().boxed());
        self.inner
            .state
            .lock()
            .unwrap()
            .retryable_ops
            .push_back(op);
        let queue = self.clone();
        self.enqueue_and_forget(move || retry_next_op(queue));
    }

    /// Schedules `op` to be queued after `delay`.
    pub fn enqueue_after_delay<F, Fut, T>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        let mut state = self.inner.state.lock().unwrap();
        let delay = if state.timer_ids_to_skip.contains(&timer_id) {
            Duration::ZERO
        } else {
            delay
        };
        let target_time = Instant::now() + delay;
        let shared = Arc::new(DelayedShared {
            id,
            timer_id,
            target_time,
            queue: self.downgrade(),
            pending: Mutex::new(Some(PendingDelayed {
                op: Box::new(move || op().boxed()),
                sender,
            })),
            timer_task: Mutex::new(None),
        });
        state.delayed_operations.push(DelayedEntry {
            id,
            timer_id,
            target_time,
            handle: Arc::clone(&shared) as Arc<dyn DelayedHandle>,
        });
        drop(state);

        let timer = Arc::clone(&shared);
        let timer_task = runtime::spawn_abortable(async move {
            runtime::sleep(delay).await;
            timer.handle_delay_elapsed();
        });
        *shared.timer_task.lock().unwrap() = timer_task;

        DelayedOperation { shared, receiver }
    }

    pub fn verify_operation_in_progress(&self) {
        hard_assert(
            self.inner.operation_in_progress.load(Ordering::SeqCst),
            "verifyOpInProgress() called when no op in progress on this queue.",
        );
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .delayed_operations
            .iter()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Makes later delayed operations with `timer_id` fire without delay.
    pub fn skip_delays_for_timer_id(&self, timer_id: TimerId) {
        self.inner
            .state
            .lock()
            .unwrap()
            .timer_ids_to_skip
            .push(timer_id);
    }

    /// Fires delayed operations in target-time order, up to and including the
    /// first one with `last_timer_id`, then waits for the queue to settle.
    pub async fn run_all_delayed_operations_until(&self, last_timer_id: TimerId) {
        self.drain().await;
        let mut due: Vec<(Instant, TimerId, Arc<dyn DelayedHandle>)> = self
            .inner
            .state
            .lock()
            .unwrap()
            .delayed_operations
            .iter()
            .map(|entry| (entry.target_time, entry.timer_id, Arc::clone(&entry.handle)))
            .collect();
        due.sort_by_key(|(target_time, _, _)| *target_time);
        for (_, timer_id, handle) in due {
            handle.skip_delay();
            if last_timer_id != TimerId::All && timer_id == last_timer_id {
                break;
            }
        }
        self.drain().await;
    }

    /// Waits until every queued operation, including ones queued while
    /// waiting, has run.
    pub async fn drain(&self) {
        loop {
            let barrier = self.enqueue_even_while_restricted(|| async { Ok(()) });
            if barrier.await.is_err() {
                break;
            }
            if self.inner.pending_jobs.load(Ordering::SeqCst) == 0 {
                break;
            }
        }
    }

    fn verify_not_failed(&self) -> FirestoreResult<()> {
        match &self.inner.state.lock().unwrap().failure {
            Some(failure) => Err(internal_error(format!(
                "AsyncQueue is already failed: {}",
                failure.message()
            ))),
            None => Ok(()),
        }
    }

    fn enqueue_internal<F, Fut, T>(
        &self,
        op: F,
        restricted: bool,
    ) -> BoxFuture<'static, FirestoreResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel::<FirestoreResult<T>>();
        let inner = Arc::clone(&self.inner);
        let job = async move {
            match inner.gate(restricted) {
                Gate::Failed(err) => {
                    inner.pending_jobs.fetch_sub(1, Ordering::SeqCst);
                    let _ = sender.send(Err(err));
                }
                Gate::Purged => {
                    inner.pending_jobs.fetch_sub(1, Ordering::SeqCst);
                }
                Gate::Run => {
                    inner.operation_in_progress.store(true, Ordering::SeqCst);
                    let outcome = AssertUnwindSafe(async move { op().await })
                        .catch_unwind()
                        .await;
                    inner.operation_in_progress.store(false, Ordering::SeqCst);
                    let result = outcome.unwrap_or_else(|panic| {
                        Err(internal_error(format!(
                            "AsyncQueue operation panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                    if let Err(err) = &result {
                        inner.record_failure(err);
                    }
                    inner.pending_jobs.fetch_sub(1, Ordering::SeqCst);
                    let _ = sender.send(result);
                }
            }
        }
        .boxed();

        self.inner.pending_jobs.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.try_send(job).is_err() {
            self.inner.pending_jobs.fetch_sub(1, Ordering::SeqCst);
            return future::ready(Err(internal_error("AsyncQueue worker has stopped"))).boxed();
        }

        async move {
            match receiver.await {
                Ok(result) => result,
                // Purged by `enter_restricted_mode(true)`: never settles.
                Err(oneshot::Canceled) => future::pending().await,
            }
        }
        .boxed()
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("AsyncQueue")
            .field("is_shutting_down", &state.is_shutting_down)
            .field("failed", &state.failure.is_some())
            .field("delayed_operations", &state.delayed_operations.len())
            .finish()
    }
}

impl WeakAsyncQueue {
    pub(crate) fn upgrade(&self) -> Option<AsyncQueue> {
        self.inner.upgrade().map(|inner| AsyncQueue { inner })
    }
}

impl Inner {
    fn gate(&self, restricted: bool) -> Gate {
        let state = self.state.lock().unwrap();
        if let Some(failure) = &state.failure {
            return Gate::Failed(failure.clone());
        }
        if !restricted && state.is_shutting_down && state.skip_non_restricted_tasks {
            return Gate::Purged;
        }
        Gate::Run
    }

    fn record_failure(&self, err: &FirestoreError) {
        log::error!(target: "firestore", "INTERNAL UNHANDLED ERROR: {err}");
        let mut state = self.state.lock().unwrap();
        if state.failure.is_none() {
            state.failure = Some(err.clone());
        }
    }

    fn remove_delayed_operation(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        let before = state.delayed_operations.len();
        state.delayed_operations.retain(|entry| entry.id != id);
        hard_assert(
            state.delayed_operations.len() + 1 == before,
            "Delayed operation not found.",
        );
    }
}

fn start_worker(receiver: Receiver<Job>) {
    runtime::spawn_detached(async move {
        while let Ok(job) = receiver.recv().await {
            job.await;
        }
    });
}

fn retry_next_op(queue: AsyncQueue) -> BoxFuture<'static, FirestoreResult<()>> {
    async move {
        let head = queue.inner.state.lock().unwrap().retryable_ops.front().cloned();
        let Some(op) = head else {
            return Ok(());
        };
        match op().await {
            Ok(()) => {
                queue.inner.state.lock().unwrap().retryable_ops.pop_front();
                queue.inner.retry_backoff.lock().unwrap().reset();
            }
            Err(err) if err.is_storage_transaction_error() => {
                log::debug!(target: "firestore", "Operation failed with retryable error: {err}");
            }
            Err(err) => return Err(err),
        }
        let has_more = !queue.inner.state.lock().unwrap().retryable_ops.is_empty();
        if has_more {
            let next = queue.clone();
            queue
                .inner
                .retry_backoff
                .lock()
                .unwrap()
                .backoff_and_run(move || retry_next_op(next));
        }
        Ok(())
    }
    .boxed()
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct PendingDelayed<T> {
    op: Box<dyn FnOnce() -> BoxFuture<'static, FirestoreResult<T>> + Send>,
    sender: oneshot::Sender<FirestoreResult<T>>,
}

struct DelayedShared<T> {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    queue: WeakAsyncQueue,
    pending: Mutex<Option<PendingDelayed<T>>>,
    timer_task: Mutex<Option<AbortHandle>>,
}

impl<T: Send + 'static> DelayedShared<T> {
    /// Disarms the operation. The queue's tracking entry is removed by
    /// whichever of fire and cancel gets here first.
    fn take_pending(&self) -> Option<PendingDelayed<T>> {
        let pending = self.pending.lock().unwrap().take();
        if pending.is_some() {
            if let Some(timer_task) = self.timer_task.lock().unwrap().take() {
                timer_task.abort();
            }
            if let Some(queue) = self.queue.upgrade() {
                queue.inner.remove_delayed_operation(self.id);
            }
        }
        pending
    }

    fn handle_delay_elapsed(self: &Arc<Self>) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let shared = Arc::clone(self);
        queue.enqueue_and_forget(move || async move {
            let Some(pending) = shared.take_pending() else {
                return Ok(());
            };
            match (pending.op)().await {
                Ok(value) => {
                    let _ = pending.sender.send(Ok(value));
                    Ok(())
                }
                Err(err) => {
                    let _ = pending.sender.send(Err(err.clone()));
                    Err(err)
                }
            }
        });
    }

    fn cancel(&self, reason: Option<&str>) {
        if let Some(pending) = self.take_pending() {
            let message = match reason {
                Some(reason) => format!("Operation cancelled: {reason}"),
                None => "Operation cancelled".to_string(),
            };
            let _ = pending.sender.send(Err(cancelled(message)));
        }
    }
}

impl<T: Send + 'static> DelayedHandle for DelayedShared<T> {
    fn skip_delay(self: Arc<Self>) {
        self.handle_delay_elapsed();
    }
}

/// An operation scheduled with [`AsyncQueue::enqueue_after_delay`].
///
/// Awaiting it yields the operation's result, or `CANCELLED` when it was
/// cancelled before it ran.
pub struct DelayedOperation<T> {
    shared: Arc<DelayedShared<T>>,
    receiver: oneshot::Receiver<FirestoreResult<T>>,
}

impl<T: Send + 'static> DelayedOperation<T> {
    pub fn timer_id(&self) -> TimerId {
        self.shared.timer_id
    }

    pub fn target_time(&self) -> Instant {
        self.shared.target_time
    }

    /// Queues the operation now instead of waiting for its timer.
    pub fn skip_delay(&self) {
        self.shared.handle_delay_elapsed();
    }

    /// Rejects the result with `CANCELLED` if the operation has not run yet.
    pub fn cancel(&self, reason: Option<&str>) {
        self.shared.cancel(reason);
    }
}

impl<T> Future for DelayedOperation<T> {
    type Output = FirestoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => {
                Poll::Ready(Err(cancelled("Operation cancelled")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{unknown, FirestoreErrorCode};
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_operations_in_order_without_interleaving() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut results = Vec::new();
        for name in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            results.push(queue.enqueue(move || async move {
                log.lock().unwrap().push(format!("{name}-start"));
                tokio::task::yield_now().await;
                log.lock().unwrap().push(format!("{name}-end"));
                Ok(())
            }));
        }
        for result in results {
            result.await.unwrap();
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a-start", "a-end", "b-start", "b-end", "c-start", "c-end"]
        );
    }

    #[tokio::test]
    async fn failure_poisons_the_queue() {
        let queue = AsyncQueue::new();
        let skipped = queue.enqueue(|| async { Err::<(), _>(unknown("boom")) });
        let after = queue.enqueue(|| async { Ok(1) });
        assert_eq!(skipped.await.unwrap_err().message(), "boom");
        assert_eq!(after.await.unwrap_err().message(), "boom");
        let err = queue.enqueue(|| async { Ok(2) }).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        assert_eq!(err.message(), "AsyncQueue is already failed: boom");
    }

    #[tokio::test]
    async fn panics_poison_the_queue() {
        let queue = AsyncQueue::new();
        let result = queue
            .enqueue(|| async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().message().contains("kaboom"));
        assert!(queue.failure().is_some());
    }

    #[tokio::test]
    async fn restricted_queue_never_settles_regular_operations() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode(false);
        let pending = queue.enqueue(|| async { Ok(()) });
        let timeout = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timeout.is_err());
        let teardown = queue.enqueue_even_while_restricted(|| async { Ok(5) });
        assert_eq!(teardown.await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_operation_fires_after_delay() {
        let queue = AsyncQueue::new();
        let op = queue.enqueue_after_delay(TimerId::TransactionRetry, Duration::from_secs(2), || async {
            Ok("done")
        });
        assert!(queue.contains_delayed_operation(TimerId::TransactionRetry));
        assert_eq!(op.await.unwrap(), "done");
        assert!(!queue.contains_delayed_operation(TimerId::TransactionRetry));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rejects_and_removes_once() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::HealthCheckTimeout, Duration::from_secs(1), move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        op.cancel(Some("test"));
        op.cancel(None);
        op.skip_delay();
        assert!(!queue.contains_delayed_operation(TimerId::HealthCheckTimeout));
        let err = op.await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        assert_eq!(err.message(), "Operation cancelled: test");
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.drain().await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_the_timer_before_its_deadline() {
        let queue = AsyncQueue::new();
        let op = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(3600), || async {
            Ok(())
        });
        let shared = Arc::downgrade(&op.shared);
        op.cancel(None);
        drop(op);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(shared.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_delayed_operations_until_stops_at_timer() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let schedule = |timer_id: TimerId, secs: u64, name: &'static str| {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(timer_id, Duration::from_secs(secs), move || async move {
                log.lock().unwrap().push(name);
                Ok(())
            })
        };
        let _late = schedule(TimerId::ListenStreamIdle, 30, "late");
        let _first = schedule(TimerId::WriteStreamIdle, 10, "first");
        let _second = schedule(TimerId::TransactionRetry, 20, "second");
        queue
            .run_all_delayed_operations_until(TimerId::TransactionRetry)
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_lane_retries_transient_storage_errors() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FirestoreError::storage_transaction("busy"))
                } else {
                    Ok(())
                }
            }
        });
        for _ in 0..10 {
            queue.run_all_delayed_operations_until(TimerId::All).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(queue.failure().is_none());
        assert!(!queue.contains_delayed_operation(TimerId::AsyncQueueRetry));
    }

    #[tokio::test]
    async fn retry_lane_propagates_other_errors() {
        let queue = AsyncQueue::new();
        queue.enqueue_retryable(|| async { Err(unknown("fatal")) });
        queue.drain().await;
        assert_eq!(queue.failure().unwrap().message(), "fatal");
    }

    #[tokio::test]
    async fn skip_delays_for_timer_id_fires_immediately() {
        let queue = AsyncQueue::new();
        queue.skip_delays_for_timer_id(TimerId::OnlineStateTimeout);
        let op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(3600), || async {
            Ok(1)
        });
        let result = tokio::time::timeout(Duration::from_secs(1), op).await;
        assert_eq!(result.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn verify_operation_in_progress_inside_operation() {
        let queue = AsyncQueue::new();
        let handle = queue.clone();
        queue
            .enqueue(move || async move {
                handle.verify_operation_in_progress();
                Ok(())
            })
            .await
            .unwrap();
    }
}
