//! Jobs, completion slots and the caller-side handle.
//!
//! Every submission variant of the dispatcher ends up as one [`Job<T>`]: a
//! boxed body, the caller's cancellation token and a shared completion slot.
//! Before it is queued the job is type-erased into a [`Task`] whose single
//! entry point either runs the body or resolves the slot without running it.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::error::{DispatchError, JobError};
use crate::priority::Priority;

/// Unique job identifier
pub type JobId = u64;

/// Priority and cancellation settings for a submission.
///
/// # Example
///
/// ```
/// use docpump_dispatch::{CancellationToken, JobOptions, Priority};
///
/// let token = CancellationToken::new();
/// let options = JobOptions::new()
///     .with_priority(Priority::High)
///     .with_token(token.clone());
///
/// assert_eq!(options.priority, Priority::High);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Priority,
    pub token: Option<CancellationToken>,
}

impl JobOptions {
    /// Normal priority, no caller token.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// A panic captured from a job body.
///
/// The original payload is kept so [`crate::Dispatcher::sync_exec`] (or the
/// caller, through [`JobPanic::resume`]) can re-raise it unchanged.
pub struct JobPanic {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl JobPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        Self {
            message: panic_message(payload.as_ref()),
            payload: Mutex::new(Some(payload)),
        }
    }

    /// The panic message, when the payload was a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the payload exactly as it was passed to `panic!`.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        match self.payload.into_inner() {
            Some(payload) => payload,
            None => Box::new(self.message),
        }
    }

    /// Re-raises the original panic on the current thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.into_payload())
    }
}

impl fmt::Debug for JobPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobPanic")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Broadcast to exception handlers when a job body panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: JobId,
    pub priority: Priority,
    pub message: String,
}

struct SlotState<T> {
    resolved: bool,
    outcome: Option<Result<T, JobError>>,
    waker: Option<Waker>,
}

/// Single-assignment completion slot shared by a job and its handle.
pub(crate) struct CompletionSlot<T> {
    state: Mutex<SlotState<T>>,
    resolved: Condvar,
}

impl<T> CompletionSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                resolved: false,
                outcome: None,
                waker: None,
            }),
            resolved: Condvar::new(),
        }
    }

    /// Stores the outcome unless one was stored before.
    ///
    /// Returns `false` (and drops `outcome`) when the slot was already resolved.
    pub(crate) fn resolve(&self, outcome: Result<T, JobError>) -> bool {
        let waker = {
            let mut state = self.state.lock();
            if state.resolved {
                return false;
            }
            state.resolved = true;
            state.outcome = Some(outcome);
            state.waker.take()
        };

        self.resolved.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.state.lock().resolved
    }
}

/// Caller-side handle to a submitted job.
///
/// Resolves to the body's value, [`JobError::Canceled`] when the token was
/// signalled before the body started, [`JobError::Panicked`] when the body
/// panicked, or a dispatch error when the job was never queued.
///
/// The handle can be awaited from async code or waited on from plain threads.
/// Dropping it does not cancel the job.
#[must_use = "dropping a JobHandle does not cancel the job"]
pub struct JobHandle<T> {
    id: JobId,
    slot: Arc<CompletionSlot<T>>,
}

impl<T> JobHandle<T> {
    /// A handle that is already resolved with `error`.
    pub(crate) fn rejected(id: JobId, error: DispatchError) -> Self {
        let slot = Arc::new(CompletionSlot::new());
        slot.resolve(Err(JobError::Dispatch(error)));
        Self { id, slot }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Returns `true` once the job has been resolved.
    pub fn is_finished(&self) -> bool {
        self.slot.is_resolved()
    }

    /// Blocks up to `timeout` for the job to resolve.
    ///
    /// Returns `true` if the job is resolved. The outcome stays in the handle
    /// and is retrieved with [`JobHandle::wait`] or by awaiting.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut state = self.slot.state.lock();
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !state.resolved {
                self.slot.resolved.wait(&mut state);
            }
            return true;
        };

        while !state.resolved {
            if self.slot.resolved.wait_until(&mut state, deadline).timed_out() {
                return state.resolved;
            }
        }
        true
    }

    /// Blocks the calling thread until the job resolves.
    pub fn wait(self) -> Result<T, JobError> {
        let mut state = self.slot.state.lock();
        while !state.resolved {
            self.slot.resolved.wait(&mut state);
        }
        state
            .outcome
            .take()
            .expect("job outcome was already taken by a completed poll")
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        if state.resolved {
            return Poll::Ready(
                state
                    .outcome
                    .take()
                    .expect("JobHandle polled after completion"),
            );
        }

        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

type Body<T> = Box<dyn FnOnce(&CancellationToken) -> T + Send>;

/// A submitted unit of work with a result of type `T`.
pub(crate) struct Job<T> {
    id: JobId,
    priority: Priority,
    token: CancellationToken,
    body: Body<T>,
    slot: Arc<CompletionSlot<T>>,
}

impl<T: Send + 'static> Job<T> {
    pub(crate) fn new<F>(id: JobId, options: JobOptions, body: F) -> (Self, JobHandle<T>)
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        let slot = Arc::new(CompletionSlot::new());
        let handle = JobHandle {
            id,
            slot: Arc::clone(&slot),
        };
        let job = Self {
            id,
            priority: options.priority,
            token: options.token.unwrap_or_default(),
            body: Box::new(body),
            slot,
        };
        (job, handle)
    }

    /// Erases the result type.
    pub(crate) fn into_task(self) -> Task {
        let Job {
            id,
            priority,
            token,
            body,
            slot,
        } = self;
        let body_token = token.clone();

        let entry = erase(move |step| match step {
            Step::Run(report) => match panic::catch_unwind(AssertUnwindSafe(|| body(&body_token))) {
                Ok(value) => {
                    slot.resolve(Ok(value));
                    true
                }
                Err(payload) => {
                    let panic = JobPanic::from_payload(payload);
                    report(&JobFailure {
                        job_id: id,
                        priority,
                        message: panic.message().to_owned(),
                    });
                    slot.resolve(Err(JobError::Panicked(panic)));
                    false
                }
            },
            Step::Abort(error) => {
                slot.resolve(Err(error));
                false
            }
        });

        Task {
            id,
            priority,
            token,
            entry,
        }
    }
}

pub(crate) enum Step<'a> {
    /// Run the body; a panic is passed to the reporter before the slot resolves.
    Run(&'a dyn Fn(&JobFailure)),
    Abort(JobError),
}

type TaskEntry = Box<dyn FnOnce(Step<'_>) -> bool + Send>;

fn erase<F>(entry: F) -> TaskEntry
where
    F: for<'a> FnOnce(Step<'a>) -> bool + Send + 'static,
{
    Box::new(entry)
}

/// A queued job with its result type erased.
pub(crate) struct Task {
    id: JobId,
    priority: Priority,
    token: CancellationToken,
    entry: TaskEntry,
}

impl Task {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs the body, catching any panic.
    ///
    /// A panic is handed to `report` before waiters can observe the failure.
    /// Returns `true` when the body ran to completion.
    pub(crate) fn run(self, report: &dyn Fn(&JobFailure)) -> bool {
        (self.entry)(Step::Run(report))
    }

    /// Resolves the job as canceled without running it.
    pub(crate) fn cancel(self) {
        self.abort(JobError::Canceled);
    }

    /// Resolves the job with `error` without running it.
    pub(crate) fn abort(self, error: JobError) {
        (self.entry)(Step::Abort(error));
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
