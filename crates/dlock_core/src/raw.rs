//! The raw delegate lock.
//!
//! [`RawDelegateLock`] protects no data of its own. Callers either take it
//! for plain mutual exclusion with [`lock`](RawDelegateLock::lock) and
//! [`unlock`](RawDelegateLock::unlock), or hand a closure to
//! [`run_delegated`](RawDelegateLock::run_delegated) and let whichever
//! context currently combines run it on their behalf.

use core::marker::PhantomData;

#[cfg(not(loom))]
use lock_api::{GuardNoSend, RawMutex};

use crate::busy_wait::Role;
use crate::pool::{self, Task};
use crate::word::{LockWord, WordState};
use crate::{LockError, Topology, fatal};

/// A flat-combining spinlock.
///
/// The lock is a single 32-bit word. Queue nodes come from the static pool
/// of the calling core, so every operation is allocation free. A lock must
/// not move while an operation on it is in flight; it is borrowed for the
/// whole operation, so safe code cannot violate this.
///
/// Critical sections handed to [`run_delegated`](Self::run_delegated) run on
/// whichever core is combining. A panic escaping one aborts the process, as
/// unwinding out of the combiner would leave every queued waiter spinning.
pub struct RawDelegateLock<C: Topology> {
    pub(crate) word: LockWord,
    pub(crate) budget: u32,
    _topology: PhantomData<fn() -> C>,
}

// Node tags keep the node state in the low two bits of the lock address.
const _: () = assert!(core::mem::align_of::<LockWord>() >= 4);

/// Caller's stack frame for a delegated closure.
struct Delegated<F, R> {
    f: Option<F>,
    ret: Option<R>,
}

/// Runs the closure stored in a [`Delegated`] frame.
///
/// # Safety
///
/// `data` must point at a live `Delegated<F, R>` nobody else accesses.
unsafe fn trampoline<F, R>(data: *mut ())
where
    F: FnOnce() -> R,
{
    let frame = unsafe { &mut *data.cast::<Delegated<F, R>>() };
    if let Some(f) = frame.f.take() {
        frame.ret = Some(f());
    }
}

impl<C: Topology> Default for RawDelegateLock<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Topology> RawDelegateLock<C> {
    loom_const_fn! {
        /// Creates a free lock whose combiners serve any number of requests.
        pub fn new() -> Self {
            Self::with_budget(u32::MAX)
        }
    }

    loom_const_fn! {
        /// Creates a free lock whose combiners serve at most `budget` foreign
        /// requests per turn before passing combiner duty on.
        ///
        /// # Arguments
        ///
        /// * `budget` - Requests a combiner runs for other contexts before it
        ///   promotes the next waiter instead; `0` hands over immediately
        pub fn with_budget(budget: u32) -> Self {
            Self {
                word: LockWord::new(),
                budget,
                _topology: PhantomData,
            }
        }
    }

    #[inline(always)]
    pub(crate) fn addr(&self) -> usize {
        pool::addr_of(self)
    }

    /// Combiner budget of this lock.
    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Whether some context holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.is_locked()
    }

    /// Decoded snapshot of the lock word.
    pub fn state(&self) -> WordState {
        self.word.state()
    }

    /// Takes the lock if it is free, without queueing.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.try_lock_inner().unwrap_or_else(|err| fatal(err))
    }

    fn try_lock_inner(&self) -> Result<bool, LockError> {
        let pool = pool::of(C::current()?)?;
        let (_, node) = pool.claim()?;
        node.prepare(self.addr(), None);
        if self.word.try_acquire() {
            return Ok(true);
        }
        pool.release()?;
        Ok(false)
    }

    /// Takes the lock, spinning until this context holds it.
    #[inline]
    pub fn lock(&self) {
        if let Err(err) = self.lock_inner() {
            fatal(err);
        }
    }

    fn lock_inner(&self) -> Result<(), LockError> {
        let cpu = C::current()?;
        let pool = pool::of(cpu)?;
        let (idx, node) = pool.claim()?;
        node.prepare(self.addr(), None);
        if self.word.try_acquire() {
            return Ok(());
        }
        match self.busy_wait(cpu, idx, node)? {
            Role::Combiner { .. } => Ok(()),
            // Nodes without a callback are promoted, never served.
            Role::Served => Err(LockError::CorruptNode),
        }
    }

    /// Runs every request queued meanwhile, then releases the lock.
    ///
    /// # Safety
    ///
    /// The calling context must hold the lock, taken by [`lock`](Self::lock)
    /// or a successful [`try_lock`](Self::try_lock) on this same core, and
    /// must not hold a lock taken after this one.
    #[inline]
    pub unsafe fn unlock(&self) {
        if let Err(err) = self.unlock_inner() {
            fatal(err);
        }
    }

    fn unlock_inner(&self) -> Result<(), LockError> {
        let cpu = C::current()?;
        let pool = pool::of(cpu)?;
        match pool.top() {
            Some((_, node)) if node.lock_addr() == self.addr() && self.is_locked() => {}
            _ => return Err(LockError::NotHeld),
        }
        let outcome = self.delegate_execution(cpu);
        pool.release()?;
        outcome
    }

    /// Runs `f` under the lock and returns its result.
    ///
    /// `f` runs on whichever context is combining when the request is found,
    /// which may be the caller itself.
    #[inline]
    pub fn run_delegated<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.try_run_delegated(f).unwrap_or_else(|err| fatal(err))
    }

    /// Like [`run_delegated`](Self::run_delegated), but reports broken
    /// preconditions instead of panicking.
    ///
    /// On error `f` has not run, except for [`LockError::CorruptTail`],
    /// which is raised after the callback completed.
    pub fn try_run_delegated<F, R>(&self, f: F) -> Result<R, LockError>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let cpu = C::current()?;
        let pool = pool::of(cpu)?;

        let mut frame = Delegated { f: Some(f), ret: None };
        let task = Task::new(trampoline::<F, R>, (&raw mut frame).cast());

        let (idx, node) = pool.claim()?;
        node.prepare(self.addr(), Some(task));

        let outcome = self.busy_wait(cpu, idx, node).and_then(|role| match role {
            Role::Served => Ok(()),
            Role::Combiner { pending } => {
                if pending {
                    // SAFETY: our node is idle and nobody else sees it.
                    unsafe { node.run_task() };
                }
                self.delegate_execution(cpu)
            }
        });
        pool.release()?;
        outcome?;

        frame.ret.take().ok_or(LockError::CorruptNode)
    }
}

#[cfg(not(loom))]
unsafe impl<C: Topology> RawMutex for RawDelegateLock<C> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    // The held node lives in the locking core's pool.
    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock(&self) {
        RawDelegateLock::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        RawDelegateLock::try_lock(self)
    }

    #[inline]
    unsafe fn unlock(&self) {
        unsafe { RawDelegateLock::unlock(self) };
    }

    #[inline]
    fn is_locked(&self) -> bool {
        RawDelegateLock::is_locked(self)
    }
}
