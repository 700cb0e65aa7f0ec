//! Cooperative synchronization primitives for loop-resident tasks

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// FIFO asynchronous mutex
///
/// Suspends contending tasks at a poll boundary instead of blocking the
/// executor thread. Used to serialize commits across loading sets: a
/// commit holds the guard across its constructor awaits, so no other
/// commit can observe the registry or symbol index mid-transition.
pub(crate) struct AsyncMutex {
    state: Mutex<MutexState>,
}

struct MutexState {
    locked: bool,
    waiters: VecDeque<Waker>,
}

impl AsyncMutex {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Resolves once the calling task holds the mutex
    pub(crate) fn lock(&self) -> LockFuture<'_> {
        LockFuture { mutex: self }
    }
}

pub(crate) struct LockFuture<'a> {
    mutex: &'a AsyncMutex,
}

impl<'a> Future for LockFuture<'a> {
    type Output = AsyncMutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.mutex.state.lock();
        if state.locked {
            state.waiters.push_back(cx.waker().clone());
            return Poll::Pending;
        }
        state.locked = true;
        Poll::Ready(AsyncMutexGuard { mutex: self.mutex })
    }
}

pub(crate) struct AsyncMutexGuard<'a> {
    mutex: &'a AsyncMutex,
}

impl Drop for AsyncMutexGuard<'_> {
    fn drop(&mut self) {
        let waker = {
            let mut state = self.mutex.state.lock();
            state.locked = false;
            state.waiters.pop_front()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
