//! Core identity for the lock.
//!
//! The lock needs two things from its platform: which core the caller runs
//! on, and how many core identities exist so the combiner knows which pools
//! to scan. A kernel answers these from its per-cpu area; [`ThreadCpus`]
//! answers them for ordinary OS threads.
//!
//! `ThreadCpus` keeps process-wide statics built on `core` atomics and is
//! left out of loom builds; models supply their own [`Topology`].

use crate::LockError;

/// Platform hook supplying core identities.
///
/// Implementations must guarantee that two contexts which can run at the same
/// time never report the same identity, except for a context and the
/// interrupts nested on top of it.
pub trait Topology {
    /// Identity of the calling context's core.
    fn current() -> Result<usize, LockError>;

    /// Number of identities to scan, `0..online()` in wrap order.
    ///
    /// Every identity [`current`](Self::current) can return must lie below
    /// this bound, and the bound may only grow. A combiner scans the pools of
    /// `0..online()` and nothing else, so a context reporting an identity at
    /// or above it could publish a request no combiner ever finds. Debug
    /// builds check the caller's own identity against it.
    fn online() -> usize;
}

#[cfg(all(feature = "std", not(loom)))]
pub use threads::ThreadCpus;

#[cfg(all(feature = "std", not(loom)))]
mod threads {
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use dlock_common::MAX_CPUS;

    use super::Topology;
    use crate::{LockError, pool};

    const WORDS: usize = MAX_CPUS.div_ceil(64);

    /// One bit per identity, set while a live thread owns it.
    static CLAIMED: [AtomicU64; WORDS] = [const { AtomicU64::new(0) }; WORDS];

    /// Highest identity ever handed out, plus one.
    static ONLINE: AtomicUsize = AtomicUsize::new(0);

    /// Identity owned by the current thread for its whole lifetime.
    struct Binding {
        id: usize,
    }

    impl Binding {
        fn claim() -> Option<Self> {
            for (word_idx, word) in CLAIMED.iter().enumerate() {
                let mut cur = word.load(Ordering::Relaxed);
                while cur != u64::MAX {
                    let bit = (!cur).trailing_zeros() as usize;
                    let id = word_idx * 64 + bit;
                    if id >= MAX_CPUS {
                        break;
                    }
                    match word.compare_exchange_weak(
                        cur,
                        cur | (1 << bit),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            ONLINE.fetch_max(id + 1, Ordering::SeqCst);
                            log::debug!("thread bound to cpu {id}");
                            return Some(Binding { id });
                        }
                        Err(actual) => cur = actual,
                    }
                }
            }
            log::error!("all {MAX_CPUS} cpu identities are taken");
            None
        }
    }

    impl Drop for Binding {
        fn drop(&mut self) {
            pool::retire(self.id);
            CLAIMED[self.id / 64].fetch_and(!(1 << (self.id % 64)), Ordering::Release);
        }
    }

    std::thread_local! {
        static BINDING: Option<Binding> = Binding::claim();
    }

    /// Topology where every OS thread is its own core.
    ///
    /// A thread claims the lowest free identity the first time it touches a
    /// lock and gives it back when it exits. At most `MAX_CPUS` threads can
    /// use delegate locks at the same time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ThreadCpus;

    impl ThreadCpus {
        /// Identity bound to the calling thread, claiming one if needed.
        pub fn id() -> Option<usize> {
            BINDING
                .try_with(|binding| binding.as_ref().map(|b| b.id))
                .ok()
                .flatten()
        }
    }

    impl Topology for ThreadCpus {
        #[inline]
        fn current() -> Result<usize, LockError> {
            Self::id().ok_or(LockError::NoCpu)
        }

        #[inline]
        fn online() -> usize {
            ONLINE.load(Ordering::SeqCst)
        }
    }

}
