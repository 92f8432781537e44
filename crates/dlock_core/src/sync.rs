#[cfg(not(loom))]
pub(crate) use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering, fence};

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU32, AtomicUsize, Ordering, fence};

/// Busy-wait hint. Under loom it yields so the model can schedule the
/// context being waited on.
#[cfg(not(loom))]
#[inline(always)]
pub(crate) fn spin_loop() {
    core::hint::spin_loop();
}

#[cfg(loom)]
#[inline]
pub(crate) fn spin_loop() {
    loom::thread::yield_now();
}
