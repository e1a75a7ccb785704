//! Error types shared by the dispatcher, jobs and the serializing lock.

use std::time::Duration;

use crate::job::JobPanic;

/// Lifecycle and submission errors raised by [`crate::Dispatcher`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is already running")]
    AlreadyRunning,
    #[error("dispatcher is not running")]
    NotRunning,
    #[error("dispatcher is shutting down and no longer accepts jobs")]
    Closed,
    #[error("invalid thread count {0}: at least one worker thread is required")]
    InvalidThreadCount(usize),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Raised by [`crate::SerializingLock`] when no permit could be obtained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting for a lock permit")]
    Timeout(Duration),
}

/// Outcome of a job that did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The token was signalled before the body started; the body never ran.
    #[error("job was canceled before it started")]
    Canceled,
    /// The body panicked. The original payload is kept inside [`JobPanic`].
    #[error("job panicked: {}", .0.message())]
    Panicked(JobPanic),
    /// The dispatcher's execution lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// The job was never queued.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl JobError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, JobError::Canceled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JobError::Panicked(_))
    }
}
