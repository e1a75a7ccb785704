//! Worker pool and pump loop.
//!
//! Each worker thread runs the same pump: dequeue the highest-priority
//! entry, leave on a stop sentinel, otherwise resolve the job as canceled or
//! run it and publish the result. A panicking body is reported and the loop
//! carries on.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::cancel::CancellationToken;
use crate::error::{DispatchError, JobError};
use crate::job::{JobFailure, Task};
use crate::lock::SerializingLock;
use crate::notify::ExceptionNotifier;
use crate::priority::{Entry, JobQueue};

thread_local! {
    static CURRENT_DISPATCHER: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Id of the dispatcher whose worker is running on this thread, if any.
pub(crate) fn current_dispatcher() -> Option<u64> {
    CURRENT_DISPATCHER.with(Cell::get)
}

/// Job counters shared between the facade and the workers.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) canceled: AtomicU64,
    pub(crate) rejected: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbump(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything a pump loop needs, shared by all workers of one run.
pub(crate) struct PumpContext {
    pub(crate) dispatcher_id: u64,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) notifier: Arc<ExceptionNotifier>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) lock: Option<Arc<SerializingLock>>,
}

impl PumpContext {
    fn pump(&self, index: usize) {
        CURRENT_DISPATCHER.with(|current| current.set(Some(self.dispatcher_id)));
        debug!(dispatcher = self.dispatcher_id, worker = index, "worker started");

        while let Some(entry) = self.queue.pop(&self.shutdown) {
            match entry {
                Entry::Stop => {
                    debug!(worker = index, "worker received stop sentinel");
                    break;
                }
                Entry::Run(task) => self.execute(task),
            }
        }

        CURRENT_DISPATCHER.with(|current| current.set(None));
        debug!(dispatcher = self.dispatcher_id, worker = index, "worker exited");
    }

    /// Resolves one task. Cancellation is checked exactly once, before the body.
    pub(crate) fn execute(&self, task: Task) {
        let id = task.id();

        if task.is_cancelled() {
            trace!(job = id, "job canceled before start");
            Counters::bump(&self.counters.canceled);
            task.cancel();
            return;
        }

        let _permit = match &self.lock {
            Some(lock) => match lock.acquire() {
                Ok(permit) => Some(permit),
                Err(err) => {
                    warn!(job = id, error = %err, "execution lock unavailable");
                    Counters::bump(&self.counters.failed);
                    task.abort(JobError::Lock(err));
                    return;
                }
            },
            None => None,
        };

        trace!(job = id, priority = %task.priority(), "running job");
        let report = |failure: &JobFailure| {
            Counters::bump(&self.counters.failed);
            error!(job = failure.job_id, message = %failure.message, "job panicked");
            self.notifier.notify(failure);
        };
        if task.run(&report) {
            Counters::bump(&self.counters.completed);
        }
    }
}

/// Counts live worker threads so `stop` can wait with a deadline.
struct ExitLatch {
    live: Mutex<usize>,
    exited: Condvar,
}

impl ExitLatch {
    fn new() -> Self {
        Self {
            live: Mutex::new(0),
            exited: Condvar::new(),
        }
    }

    fn live(&self) -> usize {
        *self.live.lock()
    }

    fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut live = self.live.lock();
        let deadline = Instant::now().checked_add(timeout);

        while *live > 0 {
            match deadline {
                Some(deadline) => {
                    if self.exited.wait_until(&mut live, deadline).timed_out() {
                        return *live == 0;
                    }
                }
                None => self.exited.wait(&mut live),
            }
        }
        true
    }
}

/// Decrements the latch when the worker's closure is dropped, whether the
/// thread returned, panicked, or was never spawned.
struct LiveGuard {
    latch: Arc<ExitLatch>,
}

impl LiveGuard {
    fn register(latch: &Arc<ExitLatch>) -> Self {
        *latch.live.lock() += 1;
        Self {
            latch: Arc::clone(latch),
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        *self.latch.live.lock() -= 1;
        self.latch.exited.notify_all();
    }
}

/// Fixed set of worker threads for one dispatcher run.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    latch: Arc<ExitLatch>,
}

impl WorkerPool {
    /// Spawns `count` workers, all pumping `context.queue`.
    ///
    /// If a spawn fails, the workers already started are stopped again
    /// before the error is returned.
    pub(crate) fn spawn(
        count: usize,
        thread_name: &str,
        context: Arc<PumpContext>,
    ) -> Result<Self, DispatchError> {
        let latch = Arc::new(ExitLatch::new());
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let name = format!("{thread_name}-{index}");
            match Worker::spawn(index, name, Arc::clone(&context), &latch) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    let pool = Self { workers, latch };
                    context.queue.push_stop(pool.len());
                    context.shutdown.cancel();
                    context.queue.close();
                    pool.join(Duration::MAX);
                    return Err(DispatchError::Spawn(err));
                }
            }
        }

        Ok(Self { workers, latch })
    }

    /// Number of worker threads in the pool.
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Worker threads that have not yet left their pump loop.
    pub(crate) fn live(&self) -> usize {
        self.latch.live()
    }

    pub(crate) fn thread_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }

    /// Waits up to `timeout` for every worker to exit.
    ///
    /// Workers still running at the deadline are detached. Returns `true`
    /// only when all of them exited in time.
    pub(crate) fn join(self, timeout: Duration) -> bool {
        let exited = self.latch.wait_for_exit(timeout);

        for worker in self.workers {
            if exited || worker.is_finished() {
                worker.join();
            } else {
                warn!(worker = %worker.name, "worker did not exit before the stop timeout");
            }
        }

        exited
    }
}

/// A single worker thread in the pool.
struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        index: usize,
        name: String,
        context: Arc<PumpContext>,
        latch: &Arc<ExitLatch>,
    ) -> std::io::Result<Self> {
        let guard = LiveGuard::register(latch);
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = guard;
            context.pump(index);
        })?;

        Ok(Self {
            name,
            thread: Some(thread),
        })
    }

    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}
