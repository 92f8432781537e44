//! Delegate (flat-combining) spinlock.
//!
//! Instead of every contending context running its own critical section,
//! one context, the combiner, runs the queued critical sections of every
//! waiting context and then releases the lock or hands combiner duty to the
//! next waiter. All state lives in a compact atomic lock word and in a fixed
//! per-core pool of queue nodes, so no operation allocates.
//!
//! The crate is `no_std`. The `std` feature (on by default) adds
//! [`cpu::ThreadCpus`], which gives every OS thread its own core identity so
//! the lock can be used from ordinary threads.
//!
//! Building with `RUSTFLAGS="--cfg loom"` swaps every atomic for its `loom`
//! counterpart so `tests/loom.rs` can model check the protocol. In that
//! configuration the constructors stop being `const`, the node pools are
//! created lazily per model execution and [`cpu::ThreadCpus`] is unavailable.

#![no_std]

#[cfg(feature = "std")]
extern crate std;

use core::fmt;

/// Declares a constructor that is `const` except under loom, whose atomics
/// cannot be built in a const context.
macro_rules! loom_const_fn {
    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty $body:block
    ) => {
        #[cfg(not(loom))]
        $(#[$attr])*
        $vis const fn $name($($arg: $ty),*) -> $ret $body

        #[cfg(loom)]
        $(#[$attr])*
        $vis fn $name($($arg: $ty),*) -> $ret $body
    };
}

/// Busy-waiting phase: publishing a request and waiting for its outcome.
///
/// Decides between fast acquisition, waiting to be served and waiting to be
/// selected as the next combiner.
mod busy_wait;

/// Delegate execution phase run by the combiner.
///
/// Scans every core's node pool for requests queued on the lock, runs their
/// callbacks and finally releases the lock or transfers combiner duty.
mod combiner;

/// Core identity and the set of cores a combiner must scan.
pub mod cpu;

/// Data-owning lock types built on the raw lock.
pub mod mutex;

/// Per-core pools of queue nodes, one node per nesting level.
pub mod pool;

/// The raw delegate lock and its public operations.
pub mod raw;

/// Atomics and spin hints, from `core` or from `loom`.
mod sync;

/// Packing of `(cpu, slot)` into the waiter bits of the lock word.
pub mod tail;

/// Atomic lock word and its state transitions.
pub mod word;

pub use cpu::Topology;
pub use mutex::{DelegateGuard, DelegateLock};
pub use raw::RawDelegateLock;

#[cfg(all(feature = "std", not(loom)))]
pub use cpu::ThreadCpus;

/// Raw delegate lock bound to OS threads.
#[cfg(all(feature = "std", not(loom)))]
pub type RawThreadLock = RawDelegateLock<ThreadCpus>;

/// Data-owning delegate lock bound to OS threads.
#[cfg(all(feature = "std", not(loom)))]
pub type ThreadLock<T> = DelegateLock<T, ThreadCpus>;

/// `lock_api` mutex backed by the delegate lock.
#[cfg(all(feature = "std", not(loom)))]
pub type DelegateMutex<T> = lock_api::Mutex<RawThreadLock, T>;

/// Guard of a [`DelegateMutex`].
#[cfg(all(feature = "std", not(loom)))]
pub type DelegateMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawThreadLock, T>;

/// Error types returned by lock operations.
///
/// Every variant is a broken precondition or a broken internal invariant.
/// None of them is recoverable by retrying; the infallible public operations
/// turn them into a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// A core tried to claim a fifth queue node.
    ///
    /// Each nesting level owns one node, so this means acquisitions were
    /// nested deeper than task, softirq, hardirq and nmi allow.
    NestingOverflow,

    /// The platform reported a core identity outside the node pools.
    CpuOutOfRange(usize),

    /// No core identity could be bound to the calling context.
    ///
    /// Raised when every identity is already taken by a live thread, or when
    /// the thread is being torn down.
    NoCpu,

    /// The lock word named a waiter that cannot exist.
    CorruptTail(u32),

    /// A queue node was observed in a state the protocol never produces.
    CorruptNode,

    /// An unlock was issued by a context that does not hold the lock.
    NotHeld,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::NestingOverflow => write!(f, "lock nesting deeper than the node pool"),
            LockError::CpuOutOfRange(cpu) => write!(f, "cpu {cpu} is outside the node pools"),
            LockError::NoCpu => write!(f, "no cpu identity available for this context"),
            LockError::CorruptTail(word) => write!(f, "lock word {word:#010x} names no valid waiter"),
            LockError::CorruptNode => write!(f, "queue node in an impossible state"),
            LockError::NotHeld => write!(f, "unlock of a lock not held by this context"),
        }
    }
}

impl core::error::Error for LockError {}

/// Aborts the current context on a fatal lock error.
#[cold]
#[inline(never)]
pub(crate) fn fatal(err: LockError) -> ! {
    log::error!("delegate lock: {err}");
    panic!("delegate lock: {err}")
}
