//! Pool of optional slots
//!
//! [RaceFree] is the [pool](crate::pool) machinery with `Option<T>` in
//! every slot: workers lease a slot they may find empty (first touch) or
//! still holding whatever some earlier holder left behind, and decide to
//! construct, accumulate into, or clear it. Iteration visits only the
//! occupied slots and walks the *blocks* rather than the free stack, so
//! it also sees values sitting in slots that happen to be leased... which
//! is why iteration (and [reset](RaceFree::reset)) take `&mut self`: live
//! [Slot]s borrow the container, and the borrow checker rules the race
//! out wholesale.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use tracing::Level;

use crate::alloc::{AllocError, NodeAlloc, SystemNodeAlloc};
use crate::pool::{block_next, block_nodes, nodes_per_block, BlockHdr, PoolCore};
use crate::stack::{LockFreeStack, Node};


/// A concurrent pool of `Option<T>` slots.
///
/// [get](Self::get) leases one slot exactly like [ObjectPool::lease]
/// (lock-free pop, gated block allocation on empty); the slot's value
/// persists across lease/release cycles until somebody `take`s it, the
/// container is [reset](Self::reset), or the container is dropped.
///
/// [ObjectPool::lease]: crate::pool::ObjectPool::lease
pub struct RaceFree<T, A: NodeAlloc = SystemNodeAlloc> {
    core: PoolCore<Option<T>, A>,
}

impl<T> RaceFree<T> {
    pub fn new() -> Self {
        Self::new_in(SystemNodeAlloc)
    }
}

impl<T> Default for RaceFree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: NodeAlloc> RaceFree<T, A> {
    /// Create a container drawing its blocks from `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Self {
            core: PoolCore::new_in(alloc),
        }
    }

    /// Lease one slot, possibly empty.
    pub fn get(&self) -> Result<Slot<'_, T>, AllocError> {
        let node = self.core.acquire()?;
        Ok(Slot {
            owner: self.core.stack(),
            node,
        })
    }

    /// Clear every slot's value without releasing any memory.
    ///
    /// `&mut self` guarantees no slot is leased out and no iteration is
    /// in flight.
    pub fn reset(&mut self) {
        tracing::event!(Level::TRACE, "race_free::reset");
        let k = nodes_per_block::<Option<T>>();
        let mut block = self.core.blocks_head();
        while !block.is_null() {
            unsafe {
                let nodes = block_nodes::<Option<T>>(block);
                for i in 0..k {
                    (*nodes.add(i)).value = None;
                }
                block = block_next(block);
            }
        }
    }

    /// Iterate the occupied slots, in block order.
    pub fn iter(&mut self) -> Occupied<'_, T> {
        Occupied {
            block: self.core.blocks_head(),
            index: 0,
            _p: PhantomData,
        }
    }

    /// Number of blocks the arena has allocated so far.
    pub fn block_count(&self) -> usize {
        self.core.block_count()
    }

    /// Number of occupied slots.
    pub fn node_count(&mut self) -> usize {
        self.iter().count()
    }
}

impl<T, A: NodeAlloc> Debug for RaceFree<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceFree")
            .field("@addr", &(self as *const _))
            .field("block_count", &self.core.block_count())
            .finish()
    }
}

/// Exclusive RAII lease of one optional slot.
///
/// Derefs to `Option<T>`, which *is* the access interface: presence is
/// `is_some()`, the value is reached through `as_ref`/`as_mut`, in-place
/// construction is [Option::insert] / [Option::get_or_insert_with], and
/// clearing is `take()` or assigning `None`. Dropping the slot pushes it
/// back with its value intact.
pub struct Slot<'pool, T> {
    owner: &'pool LockFreeStack<Option<T>>,
    node: NonNull<Node<Option<T>>>,
}

impl<T> Deref for Slot<'_, T> {
    type Target = Option<T>;

    fn deref(&self) -> &Option<T> {
        // safety: the node is exclusively ours until drop
        unsafe { &self.node.as_ref().value }
    }
}

impl<T> DerefMut for Slot<'_, T> {
    fn deref_mut(&mut self) -> &mut Option<T> {
        // safety: the node is exclusively ours until drop, and no &Node
        // outlives this call
        unsafe { &mut (*self.node.as_ptr()).value }
    }
}

impl<T> Drop for Slot<'_, T> {
    fn drop(&mut self) {
        self.owner.push(self.node);
    }
}

impl<T: Debug> Debug for Slot<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&**self).finish()
    }
}

/// Forward iterator over the occupied slots of a [RaceFree].
///
/// Walks the block list and skips empty cells, so the yield order is
/// block order, not lease order.
pub struct Occupied<'a, T> {
    block: *mut BlockHdr,
    index: usize,
    _p: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Occupied<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let k = nodes_per_block::<Option<T>>();
        loop {
            if self.block.is_null() {
                return None;
            }
            if self.index == k {
                // safety: self.block is a live block of the borrowed pool
                self.block = unsafe { block_next(self.block) };
                self.index = 0;
                continue;
            }
            // safety: in-bounds slot of a live block; &mut RaceFree means
            // no slot handle can mutate cells while we hold references
            let value = unsafe {
                let nodes = block_nodes::<Option<T>>(self.block);
                &(*nodes.add(self.index)).value
            };
            self.index += 1;
            if let Some(value) = value {
                return Some(value);
            }
        }
    }
}
