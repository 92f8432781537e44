//! Data-owning wrapper around [`RawDelegateLock`].

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::Topology;
use crate::raw::RawDelegateLock;

/// A value protected by a delegate lock.
///
/// The usual way in is [`run`](Self::run), which ships a closure to the
/// current combiner. [`lock`](Self::lock) gives a classic guard for code
/// that has to run on the calling core.
pub struct DelegateLock<T, C: Topology> {
    raw: RawDelegateLock<C>,
    data: UnsafeCell<T>,
}

// Safety: the data is only reached under the lock, by one context at a time,
// and closures that touch it are `Send`.
unsafe impl<T: Send, C: Topology> Sync for DelegateLock<T, C> {}
unsafe impl<T: Send, C: Topology> Send for DelegateLock<T, C> {}

/// Pointer to the protected data, carried into a delegated closure.
struct DataPtr<T>(*mut T);

// Safety: dereferenced only inside the critical section.
unsafe impl<T: Send> Send for DataPtr<T> {}

impl<T> DataPtr<T> {
    fn get(&self) -> *mut T {
        self.0
    }
}

impl<T, C: Topology> DelegateLock<T, C> {
    loom_const_fn! {
        /// Wraps `data` in a free lock with an unbounded combiner budget.
        pub fn new(data: T) -> Self {
            Self::with_budget(data, u32::MAX)
        }
    }

    loom_const_fn! {
        /// See [`RawDelegateLock::with_budget`].
        pub fn with_budget(data: T, budget: u32) -> Self {
            Self {
                raw: RawDelegateLock::with_budget(budget),
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Runs `f` on the protected value under the lock.
    #[inline]
    pub fn run<F, R>(&self, f: F) -> R
    where
        T: Send,
        F: FnOnce(&mut T) -> R + Send,
        R: Send,
    {
        let data = DataPtr(self.data.get());
        self.raw
            .run_delegated(move || f(unsafe { &mut *data.get() }))
    }

    /// Takes the lock on the calling core.
    #[inline]
    pub fn lock(&self) -> DelegateGuard<'_, T, C> {
        self.raw.lock();
        DelegateGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Takes the lock if it is free.
    #[inline]
    pub fn try_lock(&self) -> Option<DelegateGuard<'_, T, C>> {
        self.raw.try_lock().then(|| DelegateGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn raw(&self) -> &RawDelegateLock<C> {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Releases the [`DelegateLock`] on drop, draining queued requests first.
///
/// Must be dropped on the core that took it, hence not `Send`.
pub struct DelegateGuard<'a, T, C: Topology> {
    lock: &'a DelegateLock<T, C>,
    _not_send: PhantomData<*const ()>,
}

impl<T, C: Topology> Deref for DelegateGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, C: Topology> DerefMut for DelegateGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, C: Topology> Drop for DelegateGuard<'_, T, C> {
    fn drop(&mut self) {
        // Safety: the guard proves this core holds the lock.
        unsafe { self.lock.raw.unlock() };
    }
}
