#![forbid(unsafe_code)]

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::types::Result;

/// Shared/exclusive lock that lets a flush drain every in-flight writer.
///
/// Writers take the shared mode for the lifetime of a transaction. A flush
/// takes the exclusive mode, which waits until all shared holders are gone.
/// Once an exclusive request is queued, new shared requests wait behind it.
pub struct DrainLock {
    state: Mutex<DrainState>,
    cv: Condvar,
}

#[derive(Default, Debug)]
struct DrainState {
    readers: u32,
    writer: bool,
    writers_waiting: u32,
}

/// Snapshot of drain lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSnapshot {
    /// Number of shared holders.
    pub readers: u32,
    /// Whether the exclusive mode is held.
    pub writer: bool,
    /// Number of queued exclusive requests.
    pub writers_waiting: u32,
}

/// Guard for the shared mode.
pub struct SharedDrainGuard<'a> {
    lock: &'a DrainLock,
}

/// Guard for the exclusive mode.
pub struct ExclusiveDrainGuard<'a> {
    lock: &'a DrainLock,
}

impl DrainLock {
    /// Creates an unlocked instance.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DrainState::default()),
            cv: Condvar::new(),
        }
    }

    /// Blocks until no exclusive holder or queued exclusive request remains.
    pub fn acquire_shared(&self) -> SharedDrainGuard<'_> {
        let mut state = self.state.lock();
        while state.writer || state.writers_waiting > 0 {
            self.cv.wait(&mut state);
        }
        state.readers += 1;
        SharedDrainGuard { lock: self }
    }

    /// Takes the shared mode only if it is immediately available.
    pub fn try_acquire_shared(&self) -> Option<SharedDrainGuard<'_>> {
        let mut state = self.state.lock();
        if state.writer || state.writers_waiting > 0 {
            return None;
        }
        state.readers += 1;
        Some(SharedDrainGuard { lock: self })
    }

    /// Blocks until every shared holder has released.
    pub fn acquire_exclusive(&self) -> ExclusiveDrainGuard<'_> {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
        ExclusiveDrainGuard { lock: self }
    }

    /// Current holder counts, for stats and tests.
    pub fn snapshot(&self) -> DrainSnapshot {
        let state = self.state.lock();
        DrainSnapshot {
            readers: state.readers,
            writer: state.writer,
            writers_waiting: state.writers_waiting,
        }
    }

    fn release_shared(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.cv.notify_all();
        }
    }

    fn release_exclusive(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.cv.notify_all();
    }
}

impl Default for DrainLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SharedDrainGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

impl Drop for ExclusiveDrainGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

/// One-shot result slot that a waiting thread blocks on.
pub struct Completion<T> {
    result: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> Completion<T> {
    /// Creates a slot with no outcome yet.
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Stores the outcome; later calls are ignored.
    pub fn finish(&self, outcome: Result<T>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    /// Returns true once an outcome has been stored.
    pub fn is_done(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Blocks until the outcome is available and takes it.
    pub fn wait(&self) -> Result<T> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }

    /// Like [`Completion::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let mut guard = self.result.lock();
        if guard.is_none() {
            let _ = self.cv.wait_for(&mut guard, timeout);
        }
        guard.take()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}
