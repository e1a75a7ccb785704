//! Process-wide observation of job panics.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::job::JobFailure;

/// Callback invoked on the worker thread whenever a job body panics.
///
/// Handlers run synchronously on the pump, so they should be quick (log,
/// bump a counter, forward to a channel). A panicking handler is caught and
/// logged; it never takes the worker down.
pub type ExceptionHandler = Arc<dyn Fn(&JobFailure) + Send + Sync>;

/// Identifies a registered exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(crate) struct ExceptionNotifier {
    handlers: RwLock<Vec<(SubscriptionId, ExceptionHandler)>>,
    next_id: AtomicU64,
}

impl ExceptionNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self, handler: ExceptionHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Best-effort broadcast. Handlers are called outside the registry lock.
    pub(crate) fn notify(&self, failure: &JobFailure) {
        let handlers: Vec<ExceptionHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(failure))).is_err() {
                warn!(job = failure.job_id, "exception handler panicked");
            }
        }
    }
}

impl fmt::Debug for ExceptionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionNotifier")
            .field("handlers", &self.len())
            .finish()
    }
}
