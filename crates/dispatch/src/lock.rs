//! Serializing lock: direct mutual exclusion without the queueing pump.
//!
//! A bounded counting semaphore. Guarded bodies run on the caller's thread
//! while holding one of `permits` permits, so at most `permits` bodies are
//! ever inside at once. The permit is released by a guard's `Drop`, which
//! also runs while a panicking body unwinds.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::LockError;

/// Default time a caller waits for a permit before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Counting semaphore guarding a resource that tolerates `permits` concurrent callers.
///
/// # Example
///
/// ```
/// use docpump_dispatch::SerializingLock;
///
/// let lock = SerializingLock::new(1);
/// let pages = lock.exec(|| 3).unwrap();
/// assert_eq!(pages, 3);
/// ```
pub struct SerializingLock {
    permits: usize,
    available: Mutex<usize>,
    released: Condvar,
    timeout: Duration,
}

impl SerializingLock {
    /// Create a lock with `permits` permits and the default timeout.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is zero; such a lock could never be entered.
    pub fn new(permits: usize) -> Self {
        Self::with_timeout(permits, DEFAULT_LOCK_TIMEOUT)
    }

    /// Create a lock whose `exec`/`acquire` give up after `timeout`.
    ///
    /// # Panics
    ///
    /// Panics if `permits` is zero.
    pub fn with_timeout(permits: usize, timeout: Duration) -> Self {
        assert!(permits > 0, "a serializing lock needs at least one permit");
        Self {
            permits,
            available: Mutex::new(permits),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Total number of permits.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Permits not currently held.
    pub fn available_permits(&self) -> usize {
        *self.available.lock()
    }

    /// Timeout used by [`SerializingLock::exec`] and [`SerializingLock::acquire`].
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits up to the configured timeout for a permit.
    pub fn acquire(&self) -> Result<Permit<'_>, LockError> {
        self.acquire_timeout(self.timeout)
    }

    /// Waits up to `timeout` for a permit.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Permit<'_>, LockError> {
        let mut available = self.available.lock();
        let deadline = Instant::now().checked_add(timeout);

        while *available == 0 {
            match deadline {
                Some(deadline) => {
                    if self
                        .released
                        .wait_until(&mut available, deadline)
                        .timed_out()
                        && *available == 0
                    {
                        return Err(LockError::Timeout(timeout));
                    }
                }
                None => self.released.wait(&mut available),
            }
        }

        *available -= 1;
        Ok(Permit { lock: self })
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit { lock: self })
    }

    /// Runs `body` on the calling thread while holding a permit.
    ///
    /// Returns [`LockError::Timeout`] without calling `body` when no permit
    /// was obtained in time. A panic in `body` propagates unchanged after the
    /// permit has been released.
    pub fn exec<T, F>(&self, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> T,
    {
        self.exec_timeout(self.timeout, body)
    }

    /// [`SerializingLock::exec`] with an explicit timeout.
    pub fn exec_timeout<T, F>(&self, timeout: Duration, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> T,
    {
        let _permit = self.acquire_timeout(timeout)?;
        Ok(body())
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        debug_assert!(*available <= self.permits);
        drop(available);

        self.released.notify_one();
    }
}

impl fmt::Debug for SerializingLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializingLock")
            .field("permits", &self.permits)
            .field("available", &self.available_permits())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A held permit. Released on drop.
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit<'a> {
    lock: &'a SerializingLock,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}
