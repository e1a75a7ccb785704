//! Docpump Dispatch Library
//!
//! Serializes access to a resource that must not be entered concurrently
//! (a document engine, a native handle) behind a small pool of worker
//! threads fed by a priority queue.
//!
//! Callers submit closures at one of four priorities and get back a
//! [`JobHandle`] they can block on or `.await`. Within a priority jobs run
//! in submission order; a higher priority is always dequeued first. A job
//! whose [`CancellationToken`] is signalled before it starts resolves as
//! canceled without running. A panicking job resolves with the panic and is
//! broadcast to the registered exception handlers; the worker keeps going.
//!
//! [`SerializingLock`] offers the same guarantee without a pump: the body
//! runs on the caller's thread while holding a permit.
//!
//! # Example
//!
//! ```
//! use docpump_dispatch::{CancellationToken, Dispatcher, JobOptions, Priority};
//! use std::time::Duration;
//!
//! let dispatcher = Dispatcher::new(1);
//! dispatcher.start().unwrap();
//!
//! dispatcher.on_exception(|failure| {
//!     eprintln!("job {} failed: {}", failure.job_id, failure.message)
//! });
//!
//! let token = CancellationToken::new();
//! let thumbnail = dispatcher.submit(
//!     JobOptions::new().with_priority(Priority::Low).with_token(token.clone()),
//!     |_token| vec![0u8; 16],
//! );
//! let page_count = dispatcher.sync_exec(|| 4).unwrap();
//!
//! assert_eq!(page_count, 4);
//! assert_eq!(thumbnail.wait().unwrap().len(), 16);
//! assert!(dispatcher.stop(Duration::from_secs(5)).unwrap());
//! ```

mod cancel;
mod config;
mod dispatcher;
mod error;
mod job;
mod lock;
mod notify;
mod priority;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use config::{ConfigError, DispatcherConfig, DEFAULT_STOP_TIMEOUT, DEFAULT_THREAD_NAME};
pub use dispatcher::{Dispatcher, DispatcherState, DispatcherStats};
pub use error::{DispatchError, JobError, LockError};
pub use job::{JobFailure, JobHandle, JobId, JobOptions, JobPanic};
pub use lock::{Permit, SerializingLock, DEFAULT_LOCK_TIMEOUT};
pub use notify::{ExceptionHandler, SubscriptionId};
pub use priority::Priority;
