//! Resizable pool of worker threads draining a [`WorkQueue`].
//!
//! Workers block on the queue, claim one item at a time, and run it through a
//! [`WorkHandler`]. The target size can change at runtime: growing spawns
//! threads immediately, shrinking lets surplus workers retire the next time
//! they look for work. A running item is never interrupted by a resize.
//!
//! A panic while running or completing an item is caught at the item
//! boundary. The worker logs it, reports the failure through
//! [`WorkHandler::complete`], and keeps serving.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ServerError;
use crate::queue::{Pop, WorkQueue};
use crate::sasl::panic_message;

/// Work a pool worker performs for each queued item.
pub trait WorkHandler: Send + Sync + 'static {
    type Item: Send + 'static;
    type Job: Send;
    type Output;

    /// Called under the queue lock at the moment `item` leaves the queue.
    /// Must not block or take locks ordered before the queue lock.
    fn claim(&self, item: Self::Item) -> Self::Job;

    /// Executes the job. May block.
    fn run(&self, job: &Self::Job) -> Self::Output;

    /// Receives the output, or the panic message if `run` panicked.
    fn complete(&self, job: Self::Job, outcome: Result<Self::Output, String>);
}

struct PoolShared<H: WorkHandler> {
    queue: Arc<WorkQueue<H::Item>>,
    handler: Arc<H>,
    target: AtomicUsize,
    live: AtomicUsize,
    busy: AtomicUsize,
    next_worker: AtomicU64,
    panics: AtomicU64,
}

impl<H: WorkHandler> PoolShared<H> {
    /// Claims one retirement slot if the pool is above target.
    fn try_retire(&self) -> bool {
        let target = self.target.load(Ordering::Acquire);
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > target).then(|| live - 1)
            })
            .is_ok()
    }

    fn run_one(&self, job: H::Job) {
        self.busy.fetch_add(1, Ordering::Relaxed);
        let output = catch_unwind(AssertUnwindSafe(|| self.handler.run(&job)))
            .map_err(|payload| self.record_panic(panic_message(payload.as_ref())));
        if let Err(payload) =
            catch_unwind(AssertUnwindSafe(|| self.handler.complete(job, output)))
        {
            self.record_panic(panic_message(payload.as_ref()));
        }
        self.busy.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_panic(&self, message: String) -> String {
        self.panics.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ldapd_worker_panics_total").increment(1);
        tracing::error!(panic = %message, "worker caught panic while processing an operation");
        message
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_live(&self) {
        metrics::gauge!("ldapd_workers_live").set(self.live.load(Ordering::Relaxed) as f64);
    }
}

fn worker_loop<H: WorkHandler>(shared: &PoolShared<H>, index: u64) {
    tracing::debug!(worker = index, "worker started");
    loop {
        let popped = shared
            .queue
            .pop(|| shared.try_retire(), |item| shared.handler.claim(item));
        match popped {
            Pop::Item(job) => shared.run_one(job),
            Pop::Exit => {
                tracing::debug!(worker = index, "worker retired");
                break;
            }
            Pop::Closed => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(worker = index, "work queue closed, worker exiting");
                break;
            }
        }
    }
    shared.record_live();
}

/// A resizable set of worker threads sharing one queue and one handler.
pub struct WorkerPool<H: WorkHandler> {
    shared: Arc<PoolShared<H>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: WorkHandler> WorkerPool<H> {
    /// Spawns `size` workers.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Spawn` if a thread cannot be created; workers
    /// already spawned are told to exit.
    pub fn start(
        queue: Arc<WorkQueue<H::Item>>,
        handler: Arc<H>,
        size: usize,
    ) -> Result<Self, ServerError> {
        let pool = Self {
            shared: Arc::new(PoolShared {
                queue,
                handler,
                target: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                next_worker: AtomicU64::new(0),
                panics: AtomicU64::new(0),
            }),
            handles: Mutex::new(Vec::new()),
        };
        pool.resize(size)?;
        Ok(pool)
    }

    /// Changes the target size.
    ///
    /// Growth spawns the missing workers before returning. Shrinking wakes
    /// idle workers so the surplus retires; busy workers retire after their
    /// current item.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Spawn` if a thread cannot be created. The target
    /// is then lowered to the number of live workers.
    pub fn resize(&self, size: usize) -> Result<(), ServerError> {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());

        let previous = self.shared.target.swap(size, Ordering::AcqRel);
        while self.shared.live.load(Ordering::Acquire) < size {
            self.shared.live.fetch_add(1, Ordering::AcqRel);
            let index = self.shared.next_worker.fetch_add(1, Ordering::Relaxed);
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name(format!("ldapd-worker-{index}"))
                .spawn(move || worker_loop(&shared, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    let live = self.shared.live.fetch_sub(1, Ordering::AcqRel) - 1;
                    self.shared.target.store(live, Ordering::Release);
                    self.shared.record_live();
                    tracing::error!(error = %err, requested = size, live, "failed to spawn worker thread");
                    return Err(ServerError::Spawn(err));
                }
            }
        }
        self.shared.record_live();
        if size < previous {
            self.shared.queue.wake_all();
        }
        tracing::info!(from = previous, to = size, "worker pool resized");
        Ok(())
    }

    #[must_use]
    pub fn target(&self) -> usize {
        self.shared.target.load(Ordering::Acquire)
    }

    /// Workers that have not yet exited.
    #[must_use]
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Workers currently running an item.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Relaxed)
    }

    /// Panics caught since start.
    #[must_use]
    pub fn panics(&self) -> u64 {
        self.shared.panics.load(Ordering::Relaxed)
    }

    /// Sets the target to zero and waits up to `timeout` for every worker
    /// thread to exit. Returns `true` if they all did.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.shared.target.store(0, Ordering::Release);
        self.shared.queue.wake_all();

        let deadline = Instant::now() + timeout;
        let mut handles = self.handles.lock();
        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(JoinHandle::is_finished);
            *handles = running;
            for handle in finished {
                // The loop catches item panics, so a join error means the
                // worker died outside an item.
                if handle.join().is_err() {
                    tracing::error!("worker thread terminated abnormally");
                }
            }
            if handles.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(remaining = handles.len(), "worker pool did not drain in time");
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl<H: WorkHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.shared.target.store(0, Ordering::Release);
        self.shared.queue.wake_all();
    }
}

impl<H: WorkHandler> std::fmt::Debug for WorkerPool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("target", &self.target())
            .field("live", &self.live())
            .field("busy", &self.busy())
            .finish_non_exhaustive()
    }
}
