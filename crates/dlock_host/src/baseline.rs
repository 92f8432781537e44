//! Baseline test-and-set spinlock.
//!
//! The delegate lock is measured against the simplest possible spinlock:
//! every contender runs its own critical section after winning a CAS on a
//! shared flag. Under contention the flag's cache line bounces between every
//! core, which is exactly the cost the delegate lock amortizes.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Spinlock protecting a value.
pub struct SpinLock<T> {
    /// False when free, true when held.
    lock: AtomicBool,

    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Spins on a CAS until the flag is ours.
    ///
    /// Waits on a plain load between attempts so contenders share the line
    /// instead of fighting over it with doomed CAS operations.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

/// Holds a [`SpinLock`] and releases it on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    /// Release ordering makes the critical section visible to the next holder.
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
    }
}
