//! FIFO list of blocked consumers and their wake-up signal.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// A single-shot wake-up signal for one blocked consumer.
///
/// The waiter is enrolled under the queue lock and waited on outside it, so
/// a producer can signal it without ever touching the consumer's stack.
pub struct Waiter {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Signals the waiter. Waking an already-signaled waiter is a no-op.
    pub fn wake(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Blocks until woken or until `deadline`. Returns true if the waiter was
    /// signaled, false on timeout. A signal that raced the timeout still
    /// counts as a wake.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("signaled", &*self.signaled.lock())
            .finish()
    }
}

/// Blocked consumers in enrolment order.
///
/// Lives inside the queue state, so every method here is already serialized
/// by the queue lock.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: VecDeque<Arc<Waiter>>,
}

impl WaitQueue {
    /// Creates an empty wait queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrols a new waiter at the tail and returns its handle.
    pub fn enrol(&mut self) -> Arc<Waiter> {
        let waiter = Waiter::new();
        self.waiters.push_back(Arc::clone(&waiter));
        waiter
    }

    /// Removes a waiter that timed out. Does nothing if the waiter was
    /// already popped by a wake.
    pub fn cancel(&mut self, waiter: &Arc<Waiter>) {
        if let Some(index) = self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            self.waiters.remove(index);
        }
    }

    /// Wakes the longest-enrolled waiter, if any.
    pub fn wake_one(&mut self) {
        if let Some(waiter) = self.waiters.pop_front() {
            waiter.wake();
        }
    }

    /// Wakes every enrolled waiter.
    pub fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.wake();
        }
    }

    /// Number of currently blocked consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// True when no consumer is blocked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
