use crate::sync::{Ordering, fence};

use dlock_common::MAX_CPUS;

use crate::pool::Node;
use crate::raw::RawDelegateLock;
use crate::tail::Tail;
use crate::{LockError, Topology, pool};

/// Resolves the waiter a lock word names to its queue node.
///
/// # Returns
///
/// The waiter's cpu, slot and node, or [`LockError::CorruptTail`] when the
/// waiter bits do not name a slot of an existing pool.
fn waiter_node(word: u32) -> Result<(usize, usize, &'static Node), LockError> {
    let (cpu, idx) = Tail::from_word(word)
        .and_then(Tail::decode)
        .ok_or(LockError::CorruptTail(word))?;
    let node = pool::of(cpu)
        .ok()
        .and_then(|p| p.node(idx))
        .ok_or(LockError::CorruptTail(word))?;
    Ok((cpu, idx, node))
}

impl<C: Topology> RawDelegateLock<C> {
    /// Runs queued requests until the lock can be released or handed off.
    ///
    /// The caller holds the lock and has combiner duty. Its own node must not
    /// be queued, so the scan never finds it.
    ///
    /// Each pass clears the waiter bits, then scans the pools of every online
    /// identity in wrap order starting at `cpu`, serving queued callbacks of
    /// this lock. The first queued node found once the budget is spent, or
    /// one that waits in [`lock`](Self::lock) without a callback, is promoted
    /// to combiner instead. A pass ends by trying to release the lock. If a
    /// tail was published meanwhile, the node it names is promoted unless
    /// this pass already answered it, in which case another pass runs.
    ///
    /// # Arguments
    ///
    /// * `cpu` - Identity of the combining context. Must be below
    ///   [`Topology::online`], checked in debug builds.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the lock is released or handed to another context.
    /// [`LockError::CorruptTail`] if the published tail names no node.
    pub(crate) fn delegate_execution(&self, cpu: usize) -> Result<(), LockError> {
        let lock = self.addr();
        let mut served = 0u32;

        loop {
            self.word.clear_waiter();
            // Pairs with the fence in `busy_wait`.
            fence(Ordering::SeqCst);

            // Read after the fence so cores bound meanwhile are covered.
            let online = C::online().clamp(1, MAX_CPUS);
            debug_assert!(
                cpu < online,
                "cpu {cpu} is outside the online range 0..{online}; its waiters would never be scanned"
            );
            for offset in 0..online {
                let target = (cpu + offset) % online;
                for node in pool::of(target)?.nodes() {
                    if !node.is_queued_on(lock) {
                        continue;
                    }
                    // SAFETY: we combine for `lock` and saw the node queued
                    // on it; its owner does not touch it until we answer.
                    if served >= self.budget || !unsafe { node.has_task() } {
                        if node.promote(lock) {
                            log::trace!("cpu {cpu} hands the lock to cpu {target} after {served} requests");
                            return Ok(());
                        }
                        continue;
                    }
                    unsafe { node.serve(lock) };
                    served = served.saturating_add(1);
                }
            }

            let word = match self.word.try_release() {
                Ok(()) => return Ok(()),
                Err(word) => word,
            };

            // A waiter arrived after the tail was cleared. Hand off to it
            // unless this pass already served it, in which case scan again.
            let (tail_cpu, tail_idx, node) = waiter_node(word)?;
            if node.promote(lock) {
                log::trace!("cpu {cpu} hands the lock to tail cpu {tail_cpu} slot {tail_idx}");
                return Ok(());
            }
            log::trace!("cpu {cpu} found tail cpu {tail_cpu} already served, rescanning");
        }
    }
}
