//! FIFO handoff between the admission dispatcher and the worker pool.
//!
//! Hand-out order equals admission order. Each item is removed exactly once,
//! by one worker. The admission policy can change at runtime; a shrink below
//! the current depth only affects later admissions.

use std::collections::VecDeque;

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use crate::config::QueuePolicy;
use crate::error::AdmissionError;

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// What a waiting worker got back from [`WorkQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<R> {
    Item(R),
    /// The caller's exit predicate fired.
    Exit,
    /// The queue is closed and empty.
    Closed,
}

#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
    policy: ArcSwap<QueuePolicy>,
}

impl<T> WorkQueue<T> {
    #[must_use]
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            policy: ArcSwap::from_pointee(policy),
        }
    }

    #[must_use]
    pub fn policy(&self) -> QueuePolicy {
        **self.policy.load()
    }

    pub fn set_policy(&self, policy: QueuePolicy) {
        self.policy.store(std::sync::Arc::new(policy));
    }

    /// Appends `item` if the admission policy allows it.
    ///
    /// # Errors
    ///
    /// `QueueFull` when bounded and at capacity, `Closed` after [`close`](Self::close).
    /// The queue is unchanged on error.
    pub fn try_push(&self, item: T) -> Result<(), AdmissionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(AdmissionError::Closed);
        }
        if let Some(capacity) = self.policy().capacity() {
            if inner.items.len() >= capacity {
                return Err(AdmissionError::QueueFull { capacity });
            }
        }
        inner.items.push_back(item);
        record_depth(inner.items.len());
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Appends every item contiguously, ignoring capacity.
    ///
    /// # Errors
    ///
    /// Returns the items untouched if the queue is closed.
    pub fn push_batch(&self, items: Vec<T>) -> Result<(), Vec<T>> {
        if items.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(items);
        }
        let count = items.len();
        inner.items.extend(items);
        record_depth(inner.items.len());
        drop(inner);
        if count == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Blocks until an item is available, `should_exit` returns true, or the
    /// queue is closed and empty.
    ///
    /// `should_exit` and `claim` both run under the queue lock: `claim` sees
    /// the item at the exact point it leaves the queue.
    pub fn pop<R>(&self, mut should_exit: impl FnMut() -> bool, claim: impl FnOnce(T) -> R) -> Pop<R> {
        let mut inner = self.inner.lock();
        loop {
            if should_exit() {
                return Pop::Exit;
            }
            if let Some(item) = inner.items.pop_front() {
                record_depth(inner.items.len());
                return Pop::Item(claim(item));
            }
            if inner.closed {
                return Pop::Closed;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Stops admissions and returns whatever was still queued.
    pub fn close(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let remaining: Vec<T> = inner.items.drain(..).collect();
        record_depth(0);
        drop(inner);
        self.available.notify_all();
        remaining
    }

    /// Wakes every waiting worker so it re-checks its exit predicate.
    pub fn wake_all(&self) {
        // Taking the lock orders this wake-up after any in-progress predicate check.
        let _inner = self.inner.lock();
        self.available.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_depth(depth: usize) {
    metrics::gauge!("ldapd_work_queue_depth").set(depth as f64);
}
