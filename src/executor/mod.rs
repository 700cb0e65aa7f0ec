//! Single-threaded cooperative executor
//!
//! One OS thread runs the event loop; every operation that can suspend
//! (commits, constructors, enqueued futures) is polled on that thread, so
//! registry and graph mutations are serialized by construction. External
//! threads interact through [`EventLoopHandle::enqueue`] and the
//! [`BlockingContext`] bridge.
//!
//! Future protocol notes: the poll/ready/pending contract, the stable
//! address rule, and waker refcount discipline are exactly Rust's
//! `Future`/`Pin`/`Waker`; abort-on-any-exit-path cleanup is `Drop`.
//! Polling any future after it returned `Ready` is a contract violation.

mod blocking;
pub mod fsm;
pub(crate) mod sync;
mod task;

pub use blocking::{block_on, BlockingContext};
pub use task::EnqueuedFuture;

use crate::error::{ModuleError, ModuleResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use task::{RunQueue, Turn};
use tracing::debug;

/// Double-start sentinel: one event loop per process
static LOOP_RUNNING: AtomicBool = AtomicBool::new(false);

/// The owned event loop: a worker thread draining a FIFO ready queue
pub struct EventLoop {
    queue: Arc<RunQueue>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Start the process event loop
    ///
    /// Fails with [`ModuleError::EventLoopAlreadyRunning`] while another
    /// loop started by this process has not yet exited.
    pub fn start() -> ModuleResult<Self> {
        if LOOP_RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ModuleError::EventLoopAlreadyRunning);
        }

        let queue = RunQueue::new();
        let worker_queue = queue.clone();
        let spawned = thread::Builder::new()
            .name("modulith-event-loop".to_string())
            .spawn(move || {
                debug!("event loop started");
                while let Turn::Worked = worker_queue.turn() {}
                debug!("event loop drained, exiting");
                LOOP_RUNNING.store(false, Ordering::Release);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                LOOP_RUNNING.store(false, Ordering::Release);
                return Err(ModuleError::EventLoopStart(e.to_string()));
            }
        };

        Ok(Self {
            queue,
            thread: Some(thread),
        })
    }

    /// A cloneable handle for enqueueing work
    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            queue: self.queue.clone(),
        }
    }

    /// Signal stop and block until the loop drained and its thread exited
    pub fn join(mut self) {
        self.shutdown(true);
    }

    /// Signal stop and let the loop run to completion in the background
    pub fn detach(mut self) {
        self.shutdown(false);
    }

    /// Block until the loop has no queued or suspended work
    ///
    /// The pre-destruction flush: callers shutting down drain before
    /// dropping handles so cleanup callbacks have run.
    pub fn run_to_completion(&self) {
        self.queue.wait_idle();
    }

    /// Whether the calling thread is the loop's worker thread
    pub fn is_worker_thread(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.thread().id() == thread::current().id())
            .unwrap_or(false)
    }

    fn shutdown(&mut self, wait: bool) {
        self.queue.signal_stop();
        if let Some(thread) = self.thread.take() {
            if wait {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Neither join nor detach was called; drain synchronously so no
        // cleanup callback is lost.
        if self.thread.is_some() {
            self.shutdown(true);
        }
    }
}

/// Cloneable submission handle to the event loop
#[derive(Clone)]
pub struct EventLoopHandle {
    queue: Arc<RunQueue>,
}

impl EventLoopHandle {
    /// Transfer a future to the loop
    ///
    /// Returns a proxy future yielding the transferred future's result.
    /// Dropping the proxy before completion cancels the task: its next
    /// turn skips polling and runs cleanup (the future's `Drop`).
    pub fn enqueue<F>(&self, future: F) -> ModuleResult<EnqueuedFuture<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        task::enqueue(&self.queue, future).ok_or(ModuleError::EventLoopShutDown)
    }

    /// Fire-and-forget submission, immune to handle drops
    pub(crate) fn spawn<F>(&self, future: F) -> ModuleResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if task::spawn(&self.queue, future) {
            Ok(())
        } else {
            Err(ModuleError::EventLoopShutDown)
        }
    }

    /// Whether stop has been signalled
    pub fn is_stopping(&self) -> bool {
        self.queue.is_stopping()
    }
}
