use crate::sync::{Ordering, fence};

use crate::pool::{Node, NodeState};
use crate::raw::RawDelegateLock;
use crate::tail::Tail;
use crate::word::Publish;
use crate::{LockError, Topology};

/// What the caller has to do once its request is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// A combiner ran the callback; the result is in the caller's frame.
    Served,
    /// The caller holds the lock and must run the combiner loop before
    /// giving it up. `pending` is set when its own callback has not run yet.
    Combiner { pending: bool },
}

impl<C: Topology> RawDelegateLock<C> {
    /// Publishes `node` on this lock and waits until the request resolves.
    ///
    /// The node is marked queued before the tail is published, so a combiner
    /// that reads the tail always finds a node it may serve. If the lock
    /// turns out to be free the caller takes it directly and becomes the
    /// combiner with its own callback still pending. Otherwise it spins on
    /// its node until a combiner either serves the callback or promotes the
    /// node to combiner.
    ///
    /// # Arguments
    ///
    /// * `cpu` - Identity of the calling context.
    /// * `idx` - Slot of `node` in the pool of `cpu`.
    /// * `node` - Freshly prepared for this lock, not yet queued.
    ///
    /// # Returns
    ///
    /// The [`Role`] the caller ends up with, or an error if the lock word
    /// or the node was found in a state the protocol cannot produce.
    pub(crate) fn busy_wait(&self, cpu: usize, idx: usize, node: &Node) -> Result<Role, LockError> {
        let lock = self.addr();
        let tail = Tail::encode(cpu, idx);

        node.publish(lock);
        // Pairs with the fence after the combiner clears the tail: either the
        // combiner's scan sees this node, or the word operation below sees
        // the cleared word and leaves a tail for the combiner to find.
        fence(Ordering::SeqCst);

        match self.word.publish_tail(tail) {
            Publish::Acquired => match node.reclaim(lock) {
                // SAFETY: the node is ours and idle again.
                Ok(()) => Ok(Role::Combiner {
                    pending: unsafe { node.has_task() },
                }),
                // A combiner served us between publishing and the fast path;
                // the lock is still ours to drain and release.
                Err(NodeState::Ready) => Ok(Role::Combiner { pending: false }),
                Err(_) => Err(LockError::CorruptNode),
            },
            Publish::Queued | Publish::Behind(_) => match node.wait(lock) {
                NodeState::Ready => Ok(Role::Served),
                NodeState::Combiner => {
                    node.hold(lock);
                    log::trace!("cpu {cpu} slot {idx} promoted to combiner");
                    Ok(Role::Combiner {
                        pending: unsafe { node.has_task() },
                    })
                }
                _ => Err(LockError::CorruptNode),
            },
        }
    }
}
