//! Long-term locks for sections that cover block I/O.
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};

/// Raw lock for long-held sections.
///
/// Semantically a sleep lock: the holder may block in device I/O while
/// holding it, so waiters must be prepared to wait for a long time. On a
/// host without a scheduler seam the wait is a spin; the acquire/release
/// contract and the lock discipline are what the rest of the crate relies
/// on, not the waiting strategy.
pub struct RawSleeplock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    locked: AtomicBool,
}

/// Locks for long-held sections.
pub type SleepLock<T> = Lock<RawSleeplock, T>;
/// Guards of `SleepLock<T>`.
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }

    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleeplock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}
