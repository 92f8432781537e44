//! Lock word state machine.
//!
//! The lock word is the only cross-core state every operation touches. It has
//! three logical states:
//!
//! - **Free**: `locked = 0`, no tail.
//! - **Held**: `locked = 1`, no known waiter.
//! - **Held with waiter**: `locked = 1`, tail names a published node.
//!
//! All transfer of ownership happens through the transitions below. The tail
//! is only a hint that work arrived after the combiner's last scan; it is not
//! the head of any queue.

use crate::sync::{AtomicU32, Ordering, spin_loop};

use dlock_common::word::{LOCKED_MASK, LOCKED_VAL, UNLOCKED_VAL, WAITER_MASK};

use crate::tail::Tail;

/// Decoded view of a lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordState {
    Free,
    Held,
    HeldWithWaiter(Tail),
}

impl WordState {
    pub const fn from_raw(word: u32) -> Self {
        if word & LOCKED_MASK == 0 {
            WordState::Free
        } else {
            match Tail::from_word(word) {
                Some(tail) => WordState::HeldWithWaiter(tail),
                None => WordState::Held,
            }
        }
    }
}

/// Outcome of publishing a tail on a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The lock turned out free and was taken on the fast path.
    Acquired,
    /// The caller's tail is now the lock's tail.
    Queued,
    /// Another tail was already present; the caller waits behind it.
    Behind(Tail),
}

/// The atomic lock word.
///
/// A single `u32` shared by every context that touches the lock. The low byte
/// says whether the lock is held; the upper half optionally names the last
/// waiter that published itself while the lock was held (see
/// [`Tail`](crate::tail::Tail)). The reserved byte in between is never written.
///
/// Every method is one atomic operation, or a retry loop around one, so the
/// word can be shared freely; which context may perform which transition is
/// decided by the protocol in `busy_wait` and `combiner`, not by this type.
#[repr(transparent)]
pub struct LockWord {
    val: AtomicU32,
}

impl Default for LockWord {
    fn default() -> Self {
        Self::new()
    }
}

impl LockWord {
    loom_const_fn! {
        /// Creates a word in the free state.
        ///
        /// Usable in `static` initializers, so locks embedded in statics need
        /// no runtime setup.
        pub fn new() -> Self {
            Self {
                val: AtomicU32::new(UNLOCKED_VAL),
            }
        }
    }

    /// Loads the raw word with relaxed ordering.
    ///
    /// The value is only a snapshot: by the time the caller looks at it the
    /// lock may have changed hands. Use it for reporting and for the cheap
    /// read that precedes a compare-and-swap, never to decide ownership.
    ///
    /// # Returns
    ///
    /// The 32-bit word, locked byte and waiter bits included.
    #[inline(always)]
    pub fn raw(&self) -> u32 {
        self.val.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn state(&self) -> WordState {
        WordState::from_raw(self.raw())
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.raw() & LOCKED_MASK != 0
    }

    /// Free to Held with a single compare-and-swap.
    ///
    /// Reads first so that a held lock does not get its cache line pulled
    /// exclusive by a doomed CAS.
    #[inline(always)]
    pub fn try_acquire(&self) -> bool {
        self.val.load(Ordering::Relaxed) == UNLOCKED_VAL
            && self
                .val
                .compare_exchange(UNLOCKED_VAL, LOCKED_VAL, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Held to Held-with-waiter, installing `tail`.
    ///
    /// # Arguments
    ///
    /// * `tail` - Encoded identity of the caller's queue node, already
    ///   published as queued
    ///
    /// Retries until one of three things happens: the lock is observed free
    /// and taken, a tail is already present, or `tail` is installed over the
    /// plain held value.
    pub fn publish_tail(&self, tail: Tail) -> Publish {
        let new = LOCKED_VAL | tail.bits();
        loop {
            match self
                .val
                .compare_exchange(LOCKED_VAL, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Publish::Queued,
                Err(UNLOCKED_VAL) => {
                    if self.try_acquire() {
                        return Publish::Acquired;
                    }
                }
                Err(old) if old & WAITER_MASK != 0 => {
                    if let Some(present) = Tail::from_word(old) {
                        return Publish::Behind(present);
                    }
                }
                Err(_) => {}
            }
            spin_loop();
        }
    }

    /// Any held state back to Held, dropping the known tail.
    ///
    /// Returns the tail that was present. Waiters that published before this
    /// point are visible to the scan that follows; later ones leave a new tail.
    #[inline(always)]
    pub fn clear_waiter(&self) -> Option<Tail> {
        Tail::from_word(self.val.swap(LOCKED_VAL, Ordering::AcqRel))
    }

    /// Held to Free.
    ///
    /// Fails with the observed word when a waiter published a tail since the
    /// last [`clear_waiter`](Self::clear_waiter).
    #[inline(always)]
    pub fn try_release(&self) -> Result<(), u32> {
        self.val
            .compare_exchange(LOCKED_VAL, UNLOCKED_VAL, Ordering::Release, Ordering::Acquire)
            .map(|_| ())
    }
}
