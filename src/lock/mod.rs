//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and traits that express their behaviors.
//!
//! A lock is `Lock<R, T>`: `R` is the raw lock implementing [`RawLock`] and
//! `T` is the protected data. [`SpinLock`] is for short critical sections
//! (list and counter edits); [`SleepLock`] is for sections that cover block
//! I/O and may be held for a long time.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleeplock;
mod spinlock;

pub use sleeplock::{RawSleeplock, SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinlock, SpinLock, SpinLockGuard};

/// Raw locks that can be acquired and released.
pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);

    /// Releases the lock.
    fn release(&self);

    /// Tries to acquire the lock without waiting.
    fn try_acquire(&self) -> bool;
}

/// Locks that own their own `RawLock` and `data: T`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: the raw lock serializes all access to `data`.
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}
// SAFETY: the raw lock serializes all access to `data`.
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

/// Guards that prove the lock is held.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns its guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Acquires the lock if it is not held; returns `None` otherwise.
    pub fn try_lock(&self) -> Option<Guard<'_, R, T>> {
        if self.lock.try_acquire() {
            Some(Guard { lock: self })
        } else {
            None
        }
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
