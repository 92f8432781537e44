//! Per-core queue node pools.
//!
//! Every core owns [`MAX_NODES`] nodes, one per nesting level, in a static
//! array. A node is claimed at the current nesting depth, used for exactly
//! one lock operation and released in LIFO order. Other cores only ever reach
//! a node through the lock word's tail or by scanning while they combine.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::compiler_fence;

use dlock_common::MAX_NODES;

use crate::LockError;
use crate::sync::{AtomicUsize, Ordering, spin_loop};

const STATE_MASK: usize = 0b11;

/// Where a queue node stands in the protocol.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Owned by its context, not visible to combiners.
    Idle = 0,
    /// Published and waiting for a combiner.
    Queued = 1,
    /// A combiner ran the callback; the result is in place.
    Ready = 2,
    /// Selected to run the combiner loop next.
    Combiner = 3,
}

impl NodeState {
    const fn from_bits(bits: usize) -> Self {
        match bits & STATE_MASK {
            0 => NodeState::Idle,
            1 => NodeState::Queued,
            2 => NodeState::Ready,
            _ => NodeState::Combiner,
        }
    }
}

/// Type-erased critical section.
///
/// `data` points at a frame on the requesting context's stack, which stays
/// alive until that context observes the node leave [`NodeState::Queued`].
#[derive(Clone, Copy)]
pub(crate) struct Task {
    call: unsafe fn(*mut ()),
    data: *mut (),
}

impl Task {
    pub(crate) fn new(call: unsafe fn(*mut ()), data: *mut ()) -> Self {
        Self { call, data }
    }

    /// # Safety
    ///
    /// `data` must still point at the frame `call` expects, and no other
    /// context may run this task.
    #[inline(always)]
    unsafe fn run(self) {
        let guard = AbortOnUnwind;
        unsafe { (self.call)(self.data) };
        core::mem::forget(guard);
    }
}

/// Turns a panic escaping a delegated callback into an abort.
///
/// The callback runs with the lock held and with other contexts spinning on
/// their nodes; unwinding past the combiner would leave all of them waiting
/// forever. Dropping this guard during the unwind panics a second time, which
/// aborts the process.
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    #[cold]
    fn drop(&mut self) {
        log::error!("delegated callback unwound while holding the lock");
        panic!("delegated callback unwound while holding the lock");
    }
}

/// One queue node.
///
/// `word` holds the address of the lock the node is tagged with and the
/// node's [`NodeState`] in its low bits, so a combiner checks the tag and the
/// state in one load and a node re-used for another lock is never mistaken
/// for one of ours.
#[repr(align(64))]
pub(crate) struct Node {
    word: AtomicUsize,
    task: UnsafeCell<Option<Task>>,
}

// Safety: `task` is written only by the owning context while the node is not
// queued, and read by a combiner only after it observed the node queued with
// acquire ordering.
unsafe impl Sync for Node {}

impl Node {
    loom_const_fn! {
        fn new() -> Self {
            Self {
                word: AtomicUsize::new(0),
                task: UnsafeCell::new(None),
            }
        }
    }

    #[inline(always)]
    const fn tag(lock: usize, state: NodeState) -> usize {
        lock | state as usize
    }

    /// Fills a freshly claimed node. Owner only.
    #[inline(always)]
    pub(crate) fn prepare(&self, lock: usize, task: Option<Task>) {
        debug_assert_eq!(lock & STATE_MASK, 0);
        unsafe { *self.task.get() = task };
        self.word
            .store(Self::tag(lock, NodeState::Idle), Ordering::Release);
    }

    /// Makes the node discoverable by the combiner of `lock`.
    #[inline(always)]
    pub(crate) fn publish(&self, lock: usize) {
        self.word
            .store(Self::tag(lock, NodeState::Queued), Ordering::Release);
    }

    /// Takes a queued node back after winning the lock on the fast path.
    ///
    /// Fails with the state a previous combiner left behind.
    #[inline(always)]
    pub(crate) fn reclaim(&self, lock: usize) -> Result<(), NodeState> {
        self.word
            .compare_exchange(
                Self::tag(lock, NodeState::Queued),
                Self::tag(lock, NodeState::Idle),
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(NodeState::from_bits)
    }

    /// Marks a promoted node as holding the lock. Owner only.
    #[inline(always)]
    pub(crate) fn hold(&self, lock: usize) {
        self.word
            .store(Self::tag(lock, NodeState::Idle), Ordering::Relaxed);
    }

    /// Spins until a combiner moves the node out of the queued state.
    #[inline(always)]
    pub(crate) fn wait(&self, lock: usize) -> NodeState {
        let queued = Self::tag(lock, NodeState::Queued);
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word != queued {
                return NodeState::from_bits(word);
            }
            spin_loop();
        }
    }

    #[inline(always)]
    pub(crate) fn is_queued_on(&self, lock: usize) -> bool {
        self.word.load(Ordering::Acquire) == Self::tag(lock, NodeState::Queued)
    }

    /// Whether the node carries a callback.
    ///
    /// # Safety
    ///
    /// Caller is the owner, or the combiner of the node's lock after seeing
    /// it queued.
    #[inline(always)]
    pub(crate) unsafe fn has_task(&self) -> bool {
        unsafe { (*self.task.get()).is_some() }
    }

    /// Takes the node's callback and runs it on the calling context.
    ///
    /// # Safety
    ///
    /// Caller is the owner with no combiner serving the node, or the combiner
    /// of the node's lock after seeing it queued.
    #[inline(always)]
    pub(crate) unsafe fn run_task(&self) {
        if let Some(task) = unsafe { (*self.task.get()).take() } {
            unsafe { task.run() };
        }
    }

    /// Runs a queued node's callback and hands the result back.
    ///
    /// The release store both publishes the result and tells the waiter it
    /// is done; the node stops matching the queued tag, so no later scan can
    /// run it again.
    ///
    /// # Safety
    ///
    /// Caller is the combiner of `lock` and observed the node queued on it.
    #[inline(always)]
    pub(crate) unsafe fn serve(&self, lock: usize) {
        unsafe { self.run_task() };
        self.word
            .store(Self::tag(lock, NodeState::Ready), Ordering::Release);
    }

    /// Hands combiner duty for `lock` to this node if it is still queued on it.
    ///
    /// Several paths may race to promote the same node: the combiner's scan
    /// and its tail resolution can both reach it. The CAS lets exactly one of
    /// them win, and a node that was already served is left alone.
    ///
    /// # Returns
    ///
    /// `true` if this call moved the node from queued to combiner. The
    /// caller must then stop combining without releasing the lock.
    #[inline(always)]
    pub(crate) fn promote(&self, lock: usize) -> bool {
        self.word
            .compare_exchange(
                Self::tag(lock, NodeState::Queued),
                Self::tag(lock, NodeState::Combiner),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline(always)]
    pub(crate) fn lock_addr(&self) -> usize {
        self.word.load(Ordering::Relaxed) & !STATE_MASK
    }

    fn snapshot(&self) -> SlotSnapshot {
        let word = self.word.load(Ordering::Relaxed);
        SlotSnapshot {
            lock: word & !STATE_MASK,
            state: NodeState::from_bits(word),
        }
    }

    fn clear(&self) {
        unsafe { *self.task.get() = None };
        self.word.store(0, Ordering::Release);
    }
}

/// The nodes of one core plus its nesting counter.
///
/// Slots are handed out like a stack: a context claims the slot at the
/// current depth, and a context that interrupts it claims the next one. Since
/// an interrupt always finishes before the context it interrupted resumes,
/// releases come back in exactly the reverse order and a counter is all the
/// bookkeeping the pool needs.
///
/// `count` is only written by the owning core, so relaxed accesses plus
/// compiler fences order it against the node writes. Other cores read the
/// nodes, never the count, except for [`snapshot`].
pub(crate) struct NodePool {
    /// Number of claimed slots, i.e. the current nesting depth.
    count: AtomicUsize,

    /// One node per nesting level, indexed by depth.
    nodes: [Node; MAX_NODES],
}

impl NodePool {
    #[cfg(not(loom))]
    const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            nodes: [const { Node::new() }; MAX_NODES],
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            nodes: core::array::from_fn(|_| Node::new()),
        }
    }

    /// Claims the node of the next nesting depth. Owning core only.
    ///
    /// # Returns
    ///
    /// The slot index, which goes into the caller's tail, and the node
    /// itself. Fails with [`LockError::NestingOverflow`] when all
    /// [`MAX_NODES`] slots are in use.
    #[inline(always)]
    pub(crate) fn claim(&self) -> Result<(usize, &Node), LockError> {
        let idx = self.count.load(Ordering::Relaxed);
        if idx >= MAX_NODES {
            return Err(LockError::NestingOverflow);
        }
        self.count.store(idx + 1, Ordering::Relaxed);
        // The count must be bumped before the node is written, or an
        // interrupt on this core would claim and overwrite the same slot.
        compiler_fence(Ordering::SeqCst);
        Ok((idx, &self.nodes[idx]))
    }

    /// Releases the most recently claimed node. Owning core only.
    ///
    /// # Returns
    ///
    /// [`LockError::NotHeld`] if no node is claimed.
    #[inline(always)]
    pub(crate) fn release(&self) -> Result<(), LockError> {
        let idx = self.count.load(Ordering::Relaxed);
        if idx == 0 {
            return Err(LockError::NotHeld);
        }
        self.nodes[idx - 1].clear();
        compiler_fence(Ordering::SeqCst);
        self.count.store(idx - 1, Ordering::Relaxed);
        Ok(())
    }

    /// The most recently claimed node, if any.
    #[inline(always)]
    pub(crate) fn top(&self) -> Option<(usize, &Node)> {
        match self.count.load(Ordering::Relaxed) {
            0 => None,
            n => Some((n - 1, &self.nodes[n - 1])),
        }
    }

    #[inline(always)]
    pub(crate) fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    #[inline(always)]
    pub(crate) fn nodes(&self) -> &[Node; MAX_NODES] {
        &self.nodes
    }

    fn reset(&self) {
        for node in &self.nodes {
            node.clear();
        }
        self.count.store(0, Ordering::Release);
    }
}

#[cfg(not(loom))]
const POOL_COUNT: usize = dlock_common::MAX_CPUS;

/// Models never bind more than a handful of cores.
#[cfg(loom)]
const POOL_COUNT: usize = 4;

#[cfg(not(loom))]
static POOLS: [NodePool; POOL_COUNT] = [const { NodePool::new() }; POOL_COUNT];

#[cfg(loom)]
loom::lazy_static! {
    static ref POOLS: [NodePool; POOL_COUNT] = core::array::from_fn(|_| NodePool::new());
}

/// The node pool of `cpu`.
#[inline(always)]
pub(crate) fn of(cpu: usize) -> Result<&'static NodePool, LockError> {
    POOLS.get(cpu).ok_or(LockError::CpuOutOfRange(cpu))
}

/// Drops whatever a departed context left in its pool.
///
/// Only valid once nothing can run on `cpu` anymore.
#[cfg_attr(loom, allow(dead_code))]
pub(crate) fn retire(cpu: usize) {
    if let Some(pool) = POOLS.get(cpu) {
        if pool.count.load(Ordering::Relaxed) != 0 {
            log::warn!("cpu {cpu} retired with nodes still claimed");
        }
        pool.reset();
    }
}

/// State of one node slot as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Address of the lock the slot is tagged with, zero when unused.
    pub lock: usize,
    pub state: NodeState,
}

/// State of one core's pool as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Current nesting depth, i.e. the number of claimed slots.
    pub depth: usize,
    pub slots: [SlotSnapshot; MAX_NODES],
}

/// Racy snapshot of `cpu`'s pool, for status reporting and tests.
pub fn snapshot(cpu: usize) -> Option<PoolSnapshot> {
    let pool = POOLS.get(cpu)?;
    let mut slots = [SlotSnapshot {
        lock: 0,
        state: NodeState::Idle,
    }; MAX_NODES];
    for (slot, node) in slots.iter_mut().zip(pool.nodes.iter()) {
        *slot = node.snapshot();
    }
    Some(PoolSnapshot {
        depth: pool.count.load(Ordering::Relaxed),
        slots,
    })
}

/// Address used to tag nodes with `lock`.
#[inline(always)]
pub(crate) fn addr_of<T>(lock: &T) -> usize {
    ptr::from_ref(lock) as usize
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn fresh() -> NodePool {
        NodePool::new()
    }

    #[test]
    fn claims_follow_nesting_depth() {
        let pool = fresh();
        for depth in 0..MAX_NODES {
            let (idx, _) = pool.claim().unwrap();
            assert_eq!(idx, depth);
        }
        assert_eq!(pool.claim().err(), Some(LockError::NestingOverflow));
        assert_eq!(pool.top().map(|(idx, _)| idx), Some(MAX_NODES - 1));
    }

    #[test]
    fn release_is_lifo() {
        let pool = fresh();
        let (_, outer) = pool.claim().unwrap();
        outer.prepare(0x1000, None);
        let (_, inner) = pool.claim().unwrap();
        inner.prepare(0x2000, None);

        pool.release().unwrap();
        assert_eq!(pool.top().map(|(idx, _)| idx), Some(0));
        assert_eq!(outer.lock_addr(), 0x1000);
        assert_eq!(inner.lock_addr(), 0);

        pool.release().unwrap();
        assert_eq!(pool.release(), Err(LockError::NotHeld));
    }

    #[test]
    fn queued_node_is_served_once() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn bump(_: *mut ()) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }

        let pool = fresh();
        let (_, node) = pool.claim().unwrap();
        node.prepare(0x40, Some(Task::new(bump, ptr::null_mut())));
        node.publish(0x40);
        assert!(node.is_queued_on(0x40));
        assert!(!node.is_queued_on(0x80));

        unsafe { node.serve(0x40) };
        assert!(!node.is_queued_on(0x40));
        assert!(!node.promote(0x40));
        assert_eq!(node.wait(0x40), NodeState::Ready);
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reclaim_reports_what_the_combiner_did() {
        let pool = fresh();
        let (_, node) = pool.claim().unwrap();
        node.prepare(0x40, None);
        node.publish(0x40);
        assert_eq!(node.reclaim(0x40), Ok(()));

        node.publish(0x40);
        assert!(node.promote(0x40));
        assert_eq!(node.reclaim(0x40), Err(NodeState::Combiner));
    }
}
