//! Dispatcher facade
//!
//! Owns the worker pool and the job queue for one non-reentrant resource and
//! exposes the submission API. Every submission variant funnels into
//! [`Dispatcher::submit`], so there is exactly one execution path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, JobError};
use crate::job::{Job, JobFailure, JobHandle, JobOptions};
use crate::lock::SerializingLock;
use crate::notify::{ExceptionNotifier, SubscriptionId};
use crate::priority::JobQueue;
use crate::worker::{current_dispatcher, Counters, PumpContext, WorkerPool};

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a dispatcher.
///
/// `NotStarted -> Running -> Stopped`, and `Stopped -> Running` again on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    NotStarted,
    Running,
    Stopped,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Jobs accepted onto the queue
    pub jobs_submitted: u64,

    /// Jobs whose body ran to completion
    pub jobs_completed: u64,

    /// Jobs whose body panicked or that could not get the execution lock
    pub jobs_failed: u64,

    /// Jobs resolved as canceled without running
    pub jobs_canceled: u64,

    /// Submissions refused because the dispatcher was not running
    pub jobs_rejected: u64,

    /// Current queue size, stop sentinels included
    pub queue_size: usize,
}

impl DispatcherStats {
    /// Accepted jobs that have not been resolved yet.
    ///
    /// The counters are read one at a time, so a snapshot taken while jobs
    /// are in flight is approximate; the result never underflows.
    pub fn pending_jobs(&self) -> u64 {
        self.jobs_submitted
            .saturating_sub(self.jobs_completed)
            .saturating_sub(self.jobs_failed)
            .saturating_sub(self.jobs_canceled)
    }
}

struct Running {
    queue: Arc<JobQueue>,
    pool: WorkerPool,
    shutdown: CancellationToken,
}

enum State {
    NotStarted,
    Running(Running),
    Stopped,
}

/// Priority-queue worker pool guarding a resource that is not safe for
/// concurrent use.
///
/// Cancellation is cooperative: a job's token is checked once, right before
/// its body would start. A body that has started always runs to completion
/// (or panics); signalling its token afterwards does not interrupt it.
///
/// # Example
///
/// ```
/// use docpump_dispatch::{Dispatcher, JobOptions, Priority};
/// use std::time::Duration;
///
/// let dispatcher = Dispatcher::new(1);
/// dispatcher.start().unwrap();
///
/// let pages = dispatcher.queue_with_result(|| 12);
/// let urgent = dispatcher.queue_with_result_with(
///     JobOptions::new().with_priority(Priority::High),
///     || "first page",
/// );
///
/// assert_eq!(pages.wait().unwrap(), 12);
/// assert_eq!(urgent.wait().unwrap(), "first page");
/// assert!(dispatcher.stop(Duration::from_secs(5)).unwrap());
/// ```
pub struct Dispatcher {
    id: u64,
    config: DispatcherConfig,
    state: Mutex<State>,
    next_job_id: AtomicU64,
    notifier: Arc<ExceptionNotifier>,
    counters: Arc<Counters>,
    lock: Option<Arc<SerializingLock>>,
}

impl Dispatcher {
    /// Creates a stopped dispatcher that will run `thread_count` workers.
    pub fn new(thread_count: usize) -> Self {
        Self::with_config(DispatcherConfig::new(thread_count))
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            state: Mutex::new(State::NotStarted),
            next_job_id: AtomicU64::new(1),
            notifier: Arc::new(ExceptionNotifier::new()),
            counters: Arc::new(Counters::default()),
            lock: None,
        }
    }

    /// Runs every job body while holding a permit of `lock`.
    ///
    /// Callers that use the same lock directly through
    /// [`SerializingLock::exec`] then share one concurrency budget with the
    /// pumped jobs. Takes effect on the next [`Dispatcher::start`].
    pub fn with_execution_lock(mut self, lock: Arc<SerializingLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn execution_lock(&self) -> Option<&Arc<SerializingLock>> {
        self.lock.as_ref()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn thread_count(&self) -> usize {
        self.config.thread_count
    }

    /// Creates the queue and launches the worker threads.
    ///
    /// # Errors
    /// [`DispatchError::AlreadyRunning`] if called while running,
    /// [`DispatchError::InvalidThreadCount`] for a zero thread count,
    /// [`DispatchError::Spawn`] if the OS refused a thread.
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        if matches!(*state, State::Running(_)) {
            return Err(DispatchError::AlreadyRunning);
        }
        if self.config.thread_count == 0 {
            return Err(DispatchError::InvalidThreadCount(0));
        }

        let queue = Arc::new(JobQueue::new());
        let shutdown = CancellationToken::new();
        let context = Arc::new(PumpContext {
            dispatcher_id: self.id,
            queue: Arc::clone(&queue),
            shutdown: shutdown.clone(),
            notifier: Arc::clone(&self.notifier),
            counters: Arc::clone(&self.counters),
            lock: self.lock.clone(),
        });

        let pool = WorkerPool::spawn(self.config.thread_count, &self.config.thread_name, context)?;
        debug!(
            dispatcher = self.id,
            threads = self.config.thread_count,
            "dispatcher started"
        );

        *state = State::Running(Running {
            queue,
            pool,
            shutdown,
        });
        Ok(())
    }

    /// Shuts the workers down.
    ///
    /// Queues one Control-lane stop sentinel per worker, signals the shared
    /// shutdown token, closes the queue, then waits up to `timeout` for every
    /// worker to exit. Jobs still queued afterwards resolve as canceled.
    ///
    /// The dispatcher is `Stopped` whatever the outcome. `Ok(false)` means at
    /// least one worker was still busy at the deadline; that thread is
    /// detached, so treat the condition as an unconfirmed shutdown rather
    /// than restarting the dispatcher.
    ///
    /// # Errors
    /// [`DispatchError::NotRunning`] if the dispatcher is not running.
    pub fn stop(&self, timeout: Duration) -> Result<bool, DispatchError> {
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(running) => running,
                previous => {
                    *state = previous;
                    return Err(DispatchError::NotRunning);
                }
            }
        };

        let Running {
            queue,
            pool,
            shutdown,
        } = running;

        queue.push_stop(pool.len());
        shutdown.cancel();
        queue.close();

        let joined = pool.join(timeout);
        let abandoned = self.cancel_queued(&queue);

        if joined {
            debug!(dispatcher = self.id, abandoned, "dispatcher stopped");
        } else {
            warn!(
                dispatcher = self.id,
                ?timeout,
                abandoned,
                "dispatcher stopped before every worker exited"
            );
        }
        Ok(joined)
    }

    pub fn state(&self) -> DispatcherState {
        match *self.state.lock() {
            State::NotStarted => DispatcherState::NotStarted,
            State::Running(_) => DispatcherState::Running,
            State::Stopped => DispatcherState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Worker threads currently alive in the running pool.
    pub fn live_workers(&self) -> usize {
        match &*self.state.lock() {
            State::Running(running) => running.pool.live(),
            _ => 0,
        }
    }

    /// Names of the running pool's worker threads.
    pub fn worker_names(&self) -> Vec<String> {
        match &*self.state.lock() {
            State::Running(running) => running.pool.thread_names(),
            _ => Vec::new(),
        }
    }

    /// Returns `true` when called from one of this dispatcher's worker threads.
    pub fn is_worker_thread(&self) -> bool {
        current_dispatcher() == Some(self.id)
    }

    /// Jobs waiting in the queue.
    pub fn pending_jobs(&self) -> usize {
        self.queue().map_or(0, |queue| queue.len())
    }

    pub fn stats(&self) -> DispatcherStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DispatcherStats {
            jobs_submitted: load(&self.counters.submitted),
            jobs_completed: load(&self.counters.completed),
            jobs_failed: load(&self.counters.failed),
            jobs_canceled: load(&self.counters.canceled),
            jobs_rejected: load(&self.counters.rejected),
            queue_size: self.pending_jobs(),
        }
    }

    /// Resolves every queued job as canceled without running it.
    ///
    /// Jobs already executing are not affected. Returns how many were canceled.
    pub fn cancel_pending(&self) -> usize {
        match self.queue() {
            Some(queue) => self.cancel_queued(&queue),
            None => 0,
        }
    }

    /// Registers a handler called whenever a job body panics.
    pub fn on_exception<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&JobFailure) + Send + Sync + 'static,
    {
        self.notifier.subscribe(Arc::new(handler))
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn remove_exception_handler(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Queues a cancelable function.
    ///
    /// The body receives the job's token, which is the caller's token when
    /// one was given in `options`. If the dispatcher is not running the
    /// returned handle is already resolved with a [`JobError::Dispatch`].
    pub fn submit<T, F>(&self, options: JobOptions, body: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);

        let Some(queue) = self.queue() else {
            Counters::bump(&self.counters.rejected);
            return JobHandle::rejected(id, DispatchError::NotRunning);
        };

        let (job, handle) = Job::new(id, options, body);
        // Counted before a worker or cancel_pending can resolve it
        Counters::bump(&self.counters.submitted);
        if let Err(task) = queue.push(job.into_task()) {
            Counters::unbump(&self.counters.submitted);
            Counters::bump(&self.counters.rejected);
            task.abort(JobError::Dispatch(DispatchError::Closed));
        }
        handle
    }

    /// Fire-and-forget action at Normal priority.
    pub fn queue_for_completion<F>(&self, action: F) -> JobHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_for_completion_with(JobOptions::new(), action)
    }

    pub fn queue_for_completion_with<F>(&self, options: JobOptions, action: F) -> JobHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(options, move |_| action())
    }

    /// Function with a typed result at Normal priority.
    pub fn queue_with_result<T, F>(&self, function: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.queue_with_result_with(JobOptions::new(), function)
    }

    pub fn queue_with_result_with<T, F>(&self, options: JobOptions, function: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(options, move |_| function())
    }

    /// Runs `function` on the dispatcher and blocks until it finishes.
    ///
    /// A panic in `function` is re-raised on the calling thread with its
    /// original payload, so this never returns [`JobError::Panicked`]. When
    /// called from one of this dispatcher's own workers the function runs
    /// inline, which keeps a single-thread dispatcher from waiting on itself.
    pub fn sync_exec<T, F>(&self, function: F) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_worker_thread() {
            return Ok(function());
        }

        match self.queue_with_result(function).wait() {
            Err(JobError::Panicked(panic)) => panic.resume(),
            outcome => outcome,
        }
    }

    fn queue(&self) -> Option<Arc<JobQueue>> {
        match &*self.state.lock() {
            State::Running(running) => Some(Arc::clone(&running.queue)),
            _ => None,
        }
    }

    fn cancel_queued(&self, queue: &JobQueue) -> usize {
        let tasks = queue.drain_tasks();
        let count = tasks.len();
        for task in tasks {
            Counters::bump(&self.counters.canceled);
            task.cancel();
        }
        count
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_config(DispatcherConfig::default())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("thread_count", &self.config.thread_count)
            .finish_non_exhaustive()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        // A worker cannot wait for itself to exit
        let timeout = if self.is_worker_thread() {
            Duration::ZERO
        } else {
            self.config.stop_timeout
        };
        if let Ok(false) = self.stop(timeout) {
            warn!(dispatcher = self.id, "dropped dispatcher did not shut down cleanly");
        }
    }
}
