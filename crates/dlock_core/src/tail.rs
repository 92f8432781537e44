//! Waiter tail codec.
//!
//! A tail names one queue node by `(cpu, slot)` and lives in the upper half of
//! the lock word. The cpu is stored off by one so that an all-zero tail keeps
//! meaning "no waiter".

use dlock_common::MAX_NODES;
use dlock_common::word::{
    WAITER_CPU_MASK, WAITER_CPU_OFFSET, WAITER_IDX_MASK, WAITER_IDX_OFFSET, WAITER_MASK,
};

/// Encoded identity of a published queue node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tail(u32);

impl Tail {
    /// Packs `cpu` and `idx` into the waiter bits of a lock word.
    ///
    /// `idx` must be below the node pool capacity and `cpu + 1` must fit the
    /// waiter cpu field.
    #[inline(always)]
    pub const fn encode(cpu: usize, idx: usize) -> Self {
        debug_assert!(idx < MAX_NODES);
        let mut tail = ((cpu as u32 + 1) << WAITER_CPU_OFFSET) & WAITER_CPU_MASK;
        tail |= ((idx as u32) << WAITER_IDX_OFFSET) & WAITER_IDX_MASK;
        Tail(tail)
    }

    /// Extracts the tail from a raw lock word, `None` when no waiter is named.
    #[inline(always)]
    pub const fn from_word(word: u32) -> Option<Self> {
        match word & WAITER_MASK {
            0 => None,
            bits => Some(Tail(bits)),
        }
    }

    /// Unpacks the tail into `(cpu, idx)`.
    ///
    /// Returns `None` for waiter bits no [`encode`](Self::encode) can
    /// produce: a slot index next to an empty cpu field.
    #[inline(always)]
    pub const fn decode(self) -> Option<(usize, usize)> {
        match self.cpu() {
            Some(cpu) => Some((cpu, self.idx())),
            None => None,
        }
    }

    /// The waiter's cpu, `None` when the cpu field is empty.
    #[inline(always)]
    pub const fn cpu(self) -> Option<usize> {
        (((self.0 & WAITER_CPU_MASK) >> WAITER_CPU_OFFSET) as usize).checked_sub(1)
    }

    #[inline(always)]
    pub const fn idx(self) -> usize {
        ((self.0 & WAITER_IDX_MASK) >> WAITER_IDX_OFFSET) as usize
    }

    /// The waiter bits as they appear in the lock word.
    #[inline(always)]
    pub const fn bits(self) -> u32 {
        self.0
    }
}
