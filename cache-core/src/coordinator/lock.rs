// cache-core/src/coordinator/lock.rs

//! Writer-priority reader/writer lock with async waiters.
//!
//! Once a writer is waiting no new reader is admitted, so a steady stream of
//! readers cannot starve writers. Waiters are not ordered: every release wakes
//! all of them and whichever re-checks first wins.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Snapshot of a lock's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub writers_waiting: usize,
    pub active_readers: usize,
    pub active_writer: bool,
}

#[derive(Debug, Default)]
pub struct ResourceLock {
    state: Mutex<LockState>,
    released: Notify,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    /// Waits for shared access. Dropping the future while waiting leaves the
    /// lock untouched.
    pub async fn read(self: &Arc<Self>) -> ReadGuard {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.writers_waiting == 0 && !state.active_writer {
                    state.active_readers += 1;
                    return ReadGuard {
                        lock: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    /// Waits for exclusive access. Dropping the future while waiting
    /// withdraws the writer's claim and wakes blocked readers.
    pub async fn write(self: &Arc<Self>) -> WriteGuard {
        self.state.lock().writers_waiting += 1;
        let mut claim = WaitingWriter {
            lock: self,
            armed: true,
        };

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.active_readers == 0 && !state.active_writer {
                    state.active_writer = true;
                    state.writers_waiting -= 1;
                    claim.armed = false;
                    return WriteGuard {
                        lock: Arc::clone(self),
                    };
                }
            }
            notified.await;
        }
    }

    fn release(&self, update: impl FnOnce(&mut LockState)) {
        update(&mut self.state.lock());
        self.released.notify_waiters();
    }
}

struct WaitingWriter<'a> {
    lock: &'a ResourceLock,
    armed: bool,
}

impl Drop for WaitingWriter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.release(|state| state.writers_waiting -= 1);
        }
    }
}

/// Shared hold; released on drop.
#[derive(Debug)]
pub struct ReadGuard {
    lock: Arc<ResourceLock>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.lock.release(|state| state.active_readers -= 1);
    }
}

/// Exclusive hold; released on drop.
#[derive(Debug)]
pub struct WriteGuard {
    lock: Arc<ResourceLock>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.lock.release(|state| state.active_writer = false);
    }
}
