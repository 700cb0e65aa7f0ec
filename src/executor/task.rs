//! Task bookkeeping for the event loop
//!
//! A task owns an enqueued future, its result slot, and its cancellation
//! state. Once enqueued the loop is the only poller; callers interact
//! through the [`EnqueuedFuture`] proxy returned at enqueue time.

use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

/// Shared ready queue driven by the executor thread
pub(crate) struct RunQueue {
    inner: Mutex<QueueInner>,
    condvar: Condvar,
}

struct QueueInner {
    /// Tasks ready to be polled, FIFO
    ready: VecDeque<Arc<Task>>,
    /// Tasks enqueued and not yet finished (queued or suspended)
    live: usize,
    /// Set once the owning handle signalled stop
    stopping: bool,
}

/// One iteration outcome for the worker loop
pub(crate) enum Turn {
    /// A task was polled (or cleaned up)
    Worked,
    /// Queue empty and stop signalled with no live tasks
    Finished,
}

impl RunQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                ready: VecDeque::new(),
                live: 0,
                stopping: false,
            }),
            condvar: Condvar::new(),
        })
    }

    /// Push a task to the back of the ready queue
    fn push(&self, task: Arc<Task>) {
        let mut inner = self.inner.lock();
        inner.ready.push_back(task);
        self.condvar.notify_all();
    }

    /// Signal the loop to exit once drained
    pub(crate) fn signal_stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopping = true;
        self.condvar.notify_all();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.lock().stopping
    }

    /// Block until the loop has neither queued nor suspended work
    pub(crate) fn wait_idle(&self) {
        let mut inner = self.inner.lock();
        while !(inner.ready.is_empty() && inner.live == 0) {
            self.condvar.wait(&mut inner);
        }
    }

    /// Register a new task; fails after stop was signalled
    fn admit(&self, task: &Arc<Task>) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopping {
            return false;
        }
        inner.live += 1;
        inner.ready.push_back(task.clone());
        self.condvar.notify_all();
        true
    }

    /// A task transitioned to finished; wake idle/exit waiters
    fn retire(&self) {
        let mut inner = self.inner.lock();
        inner.live = inner.live.saturating_sub(1);
        self.condvar.notify_all();
    }

    /// One worker-loop iteration: wait for a ready task and poll it
    pub(crate) fn turn(self: &Arc<Self>) -> Turn {
        let task = {
            let mut inner = self.inner.lock();
            loop {
                if let Some(task) = inner.ready.pop_front() {
                    break task;
                }
                if inner.stopping && inner.live == 0 {
                    return Turn::Finished;
                }
                self.condvar.wait(&mut inner);
            }
        };
        task.run(self);
        Turn::Worked
    }
}

/// An enqueued future together with its scheduling state
pub(crate) struct Task {
    /// The future; `None` once the task finished or was cancelled
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    /// Queue to re-enter on wake
    queue: Weak<RunQueue>,
    /// Wake coalescing: at most one pending schedule
    scheduled: AtomicBool,
    /// Cancellation requested by dropping the proxy future
    cancelled: AtomicBool,
}

impl Task {
    fn new(future: BoxFuture<'static, ()>, queue: &Arc<RunQueue>) -> Arc<Self> {
        Arc::new(Self {
            future: Mutex::new(Some(future)),
            queue: Arc::downgrade(queue),
            scheduled: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Request cancellation; the loop cleans up on its next turn for this task
    pub(crate) fn cancel(self: &Arc<Self>) {
        self.cancelled.store(true, Ordering::Release);
        self.schedule();
    }

    /// Enqueue for polling unless a schedule is already pending
    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.push(self.clone());
        }
    }

    /// Poll (or clean up) this task on the executor thread
    fn run(self: Arc<Self>, queue: &Arc<RunQueue>) {
        // Clear before polling so wakes during the poll re-enqueue.
        self.scheduled.store(false, Ordering::Release);

        let mut slot = self.future.lock();
        let Some(mut future) = slot.take() else {
            // Already finished; a stale wake or cancel raced us.
            return;
        };

        if self.cancelled.load(Ordering::Acquire) {
            // Data cleanup: drop without polling.
            drop(future);
            drop(slot);
            queue.retire();
            return;
        }

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                drop(slot);
                queue.retire();
            }
            Poll::Pending => {
                *slot = Some(future);
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// Result slot shared between a task and its proxy future
struct JoinState<T> {
    result: Mutex<Option<T>>,
    waker: Mutex<Option<Waker>>,
    done: AtomicBool,
}

impl<T> JoinState<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            waker: Mutex::new(None),
            done: AtomicBool::new(false),
        })
    }

    fn complete(&self, value: T) {
        *self.result.lock() = Some(value);
        self.done.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// Proxy future for a task transferred to the event loop
///
/// Yields the enqueued future's result. Dropping it before completion
/// cancels the task: the loop's next turn for the task skips polling and
/// drops the future; a produced-but-unconsumed result is dropped with
/// this proxy. Polling again after `Ready` is a contract violation and
/// reports `Pending` forever.
pub struct EnqueuedFuture<T> {
    state: Arc<JoinState<T>>,
    task: Arc<Task>,
    consumed: bool,
}

impl<T> EnqueuedFuture<T> {
    /// Whether the underlying task produced its result
    pub fn is_finished(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }
}

impl<T: Send> Future for EnqueuedFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.consumed {
            debug_assert!(false, "EnqueuedFuture polled after Ready");
            return Poll::Pending;
        }
        // Register before re-checking `done` so a completion racing this
        // poll is guaranteed to observe the waker.
        *this.state.waker.lock() = Some(cx.waker().clone());
        if this.state.done.load(Ordering::Acquire) {
            if let Some(value) = this.state.result.lock().take() {
                this.consumed = true;
                return Poll::Ready(value);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for EnqueuedFuture<T> {
    fn drop(&mut self) {
        if !self.consumed && !self.state.done.load(Ordering::Acquire) {
            self.task.cancel();
        }
    }
}

/// Transfer a future to the queue, returning its proxy
pub(crate) fn enqueue<F>(queue: &Arc<RunQueue>, future: F) -> Option<EnqueuedFuture<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let state = JoinState::new();
    let completion = state.clone();
    let wrapped: BoxFuture<'static, ()> = Box::pin(async move {
        let value = future.await;
        completion.complete(value);
    });
    let task = Task::new(wrapped, queue);
    if !queue.admit(&task) {
        return None;
    }
    Some(EnqueuedFuture {
        state,
        task,
        consumed: false,
    })
}

/// Fire-and-forget variant: no proxy, never cancelled by a handle drop
pub(crate) fn spawn<F>(queue: &Arc<RunQueue>, future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = Task::new(Box::pin(future), queue);
    queue.admit(&task)
}
