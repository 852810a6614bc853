//! `OperationLock`: the admission gate serializing relocation hand-off
//! against in-flight writes (§4.6, invariant 5).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationLockError {
    #[error("operation lock is closed")]
    Closed,

    #[error("timed out waiting for in-flight operations to drain after {0:?}")]
    Timeout(Duration),
}

/// Something that can run a closure, standing in for "a thread pool
/// executor" without pulling in an async runtime (§5: parallel threads).
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Runs the job on the caller's thread. Suitable for tests and for callers
/// that are already off the hot path.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

struct State {
    in_flight: usize,
    blocked: bool,
    closed: bool,
}

/// A granted permit. Releasing is automatic on drop so every exit path —
/// including panics — gives the permit back (§5 scoped acquisitions).
pub struct Permit {
    lock: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.lock.release();
    }
}

struct Inner {
    state: Mutex<State>,
    drained: Condvar,
    queue: Mutex<VecDeque<QueuedWaiter>>,
}

struct QueuedWaiter {
    executor: Arc<dyn Executor>,
    callback: Box<dyn FnOnce(Result<Permit, OperationLockError>) + Send>,
}

#[derive(Clone)]
pub struct OperationLock {
    inner: Arc<Inner>,
}

impl Default for OperationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State { in_flight: 0, blocked: false, closed: false }),
                drained: Condvar::new(),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Grant a permit. If no block is in effect the grant happens inline
    /// (synchronously, on the caller's thread); otherwise the callback is
    /// queued and fired on `executor` once the block ends, in FIFO order.
    ///
    /// `is_replica` is accepted for symmetry with the source interface;
    /// replicas never block-all (§4.5 note 2) but still consume a slot.
    pub fn acquire(
        &self,
        executor: Arc<dyn Executor>,
        callback: Box<dyn FnOnce(Result<Permit, OperationLockError>) + Send>,
        _is_replica: bool,
    ) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            drop(state);
            executor.execute(Box::new(move || callback(Err(OperationLockError::Closed))));
            return;
        }
        if !state.blocked {
            state.in_flight += 1;
            drop(state);
            let permit = Permit { lock: self.inner.clone() };
            callback(Ok(permit));
            return;
        }
        // Queue while still holding `state`: `block_operations` must take
        // this same lock to flip `blocked` back to `false` before it drains
        // the queue, so holding it across the push closes the window where
        // a drain could finish before this waiter is in line to see it.
        self.inner.queue.lock().unwrap().push_back(QueuedWaiter { executor, callback });
    }

    /// Wait until in-flight operations drain to zero, then run
    /// `on_zero_in_flight` with exclusive access, then unblock and release
    /// queued waiters in FIFO order.
    pub fn block_operations<F: FnOnce()>(
        &self,
        timeout: Duration,
        on_zero_in_flight: F,
    ) -> Result<(), OperationLockError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(OperationLockError::Closed);
        }
        state.blocked = true;
        while state.in_flight != 0 {
            let now = Instant::now();
            if now >= deadline {
                state.blocked = false;
                return Err(OperationLockError::Timeout(timeout));
            }
            let (guard, timeout_result) =
                self.inner.drained.wait_timeout(state, deadline - now).unwrap();
            state = guard;
            if timeout_result.timed_out() && state.in_flight != 0 {
                state.blocked = false;
                return Err(OperationLockError::Timeout(timeout));
            }
        }
        on_zero_in_flight();
        state.blocked = false;
        drop(state);
        self.drain_queue();
        Ok(())
    }

    fn drain_queue(&self) {
        let waiters: Vec<QueuedWaiter> = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for waiter in waiters {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                drop(state);
                let executor = waiter.executor;
                let callback = waiter.callback;
                executor.execute(Box::new(move || callback(Err(OperationLockError::Closed))));
                continue;
            }
            state.in_flight += 1;
            drop(state);
            let permit = Permit { lock: self.inner.clone() };
            let callback = waiter.callback;
            waiter.executor.execute(Box::new(move || callback(Ok(permit))));
        }
    }

    fn release(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.inner.drained.notify_all();
        }
    }

    pub fn active_operations_count(&self) -> usize {
        self.inner.state.lock().unwrap().in_flight
    }

    /// Refuse new acquisitions; pending listeners receive a closed failure.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.drain_queue();
    }
}
