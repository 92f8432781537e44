//! Common definitions shared across the delegate lock workspace.
//!
//! This crate holds the bit layout of the lock word, the execution nesting
//! levels that select a node slot, and the capacity constants that size the
//! per-core node pools. Everything here is plain data so that the lock core,
//! the control parser and the benchmark host agree on a single layout.

#![no_std]

/// Upper bound on the number of core identities a lock can serve.
///
/// Sizes the static node pools. A tail encodes `cpu + 1` in the high bits of
/// the lock word, which leaves room for far more cores than this; the bound
/// only exists to keep the pools statically allocated.
pub const MAX_CPUS: usize = 256;

/// Number of queue nodes each core owns, one per nesting level.
pub const MAX_NODES: usize = 4;

// Bit layout of the 32-bit lock word.
//
//  0- 7: locked byte
//  8-15: reserved
// 16-17: waiter slot index
// 18-31: waiter cpu (+1)
pub mod word {
    /// Offset of the locked byte.
    pub const LOCKED_OFFSET: u32 = 0;

    /// Width of the locked byte.
    pub const LOCKED_BITS: u32 = 8;

    /// Mask selecting the locked byte.
    pub const LOCKED_MASK: u32 = ((1 << LOCKED_BITS) - 1) << LOCKED_OFFSET;

    /// Offset of the reserved byte. Never written by the lock.
    pub const RESERVED_OFFSET: u32 = LOCKED_OFFSET + LOCKED_BITS;

    /// Width of the reserved byte.
    pub const RESERVED_BITS: u32 = 8;

    /// Offset of the waiter slot index.
    pub const WAITER_IDX_OFFSET: u32 = RESERVED_OFFSET + RESERVED_BITS;

    /// Width of the waiter slot index; two bits cover the four nesting levels.
    pub const WAITER_IDX_BITS: u32 = 2;

    /// Mask selecting the waiter slot index.
    pub const WAITER_IDX_MASK: u32 = ((1 << WAITER_IDX_BITS) - 1) << WAITER_IDX_OFFSET;

    /// Offset of the waiter cpu field.
    pub const WAITER_CPU_OFFSET: u32 = WAITER_IDX_OFFSET + WAITER_IDX_BITS;

    /// Width of the waiter cpu field, everything above the slot index.
    pub const WAITER_CPU_BITS: u32 = 32 - WAITER_CPU_OFFSET;

    /// Mask selecting the waiter cpu field.
    pub const WAITER_CPU_MASK: u32 = ((1 << WAITER_CPU_BITS) - 1) << WAITER_CPU_OFFSET;

    /// Mask selecting the whole waiter tail.
    pub const WAITER_MASK: u32 = WAITER_IDX_MASK | WAITER_CPU_MASK;

    /// Lock word value of a held lock with no known waiter.
    pub const LOCKED_VAL: u32 = 1 << LOCKED_OFFSET;

    /// Lock word value of a free lock.
    pub const UNLOCKED_VAL: u32 = 0;
}

/// Execution context nesting levels.
///
/// A core can be interrupted while it is waiting on (or holding) a lock, and
/// the interrupt handler may itself take a lock. Each level gets its own node
/// slot so a nested acquisition never overwrites the interrupted one. The
/// hardware bounds nesting to these four levels.
pub mod nesting {
    /// Nesting level of an execution context, mapped 1:1 to a node slot.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Level {
        /// Normal task context.
        Task = 0,
        /// Soft interrupt context.
        SoftIrq = 1,
        /// Hard interrupt context.
        HardIrq = 2,
        /// Non-maskable interrupt context.
        Nmi = 3,
    }

    impl Level {
        /// Returns the level that owns slot `idx`, if any.
        pub const fn from_index(idx: usize) -> Option<Self> {
            match idx {
                0 => Some(Level::Task),
                1 => Some(Level::SoftIrq),
                2 => Some(Level::HardIrq),
                3 => Some(Level::Nmi),
                _ => None,
            }
        }

        /// Slot index of this level in a node pool.
        pub const fn index(self) -> usize {
            self as usize
        }

        pub const fn name(self) -> &'static str {
            match self {
                Level::Task => "task",
                Level::SoftIrq => "softirq",
                Level::HardIrq => "hardirq",
                Level::Nmi => "nmi",
            }
        }
    }
}

const _: () = assert!(nesting::Level::Nmi as usize + 1 == MAX_NODES);
const _: () = assert!(MAX_NODES <= 1 << word::WAITER_IDX_BITS);
const _: () = assert!(MAX_CPUS < (1 << word::WAITER_CPU_BITS) - 1);

#[cfg(test)]
mod tests {
    use super::nesting::Level;
    use super::word::*;
    use super::MAX_NODES;

    #[test]
    fn every_slot_has_a_level() {
        for idx in 0..MAX_NODES {
            assert_eq!(Level::from_index(idx).map(Level::index), Some(idx));
        }
        assert_eq!(Level::from_index(MAX_NODES), None);
        assert!(Level::Task < Level::Nmi);
    }

    #[test]
    fn waiter_fields_do_not_overlap_the_locked_byte() {
        assert_eq!(WAITER_MASK & LOCKED_MASK, 0);
        assert_eq!(WAITER_IDX_MASK & WAITER_CPU_MASK, 0);
        assert_eq!(WAITER_IDX_MASK | WAITER_CPU_MASK, WAITER_MASK);
        assert_eq!(LOCKED_VAL & !LOCKED_MASK, 0);
    }
}
