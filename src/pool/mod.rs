//! Concurrent object pool fed by a block arena
//!
//! Layering, bottom up:
//!
//! - a block is one raw allocation holding a header (the block-list link)
//!   followed by a fixed number of default-constructed [Node]s, sized so
//!   the whole block fits in [MAX_BLOCK_SIZE] bytes
//! - [PoolCore] owns the block list behind a mutex (the *admission gate*)
//!   and a [LockFreeStack] of the currently available nodes. Leasing pops
//!   from the stack without any locking; only the empty-stack slow path
//!   takes the gate, re-checks, and carves a fresh block
//! - [ObjectPool] is the public veneer: [Lease] is the RAII owner of one
//!   node, [Snapshot] of a whole drained chain. Dropping either pushes the
//!   node(s) back
//!
//! Memory only ever flows one way: allocator -> block list -> stack <->
//! handles. Blocks are freed exclusively by the pool's destructor (in
//! reverse insertion order), which is the entire reclamation scheme: no
//! thread can observe a freed node because nothing is freed while the
//! pool is reachable.
//!
//! ```text
//!   blocks (mutex) ->  +-------+      +-------+
//!                      | hdr   |  ->  | hdr   |  -> (null)
//!                      | n0 n1 |      | n0 n1 |
//!                      | ..    |      | ..    |
//!                      +-------+      +-------+
//!                         ^ nodes circulate between
//!                         v stack and handles
//!   stack (DWCAS)  ->  n3 -> n7 -> n1 -> (null)
//! ```

use std::alloc::Layout;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, PoisonError};

use tracing::Level;

use crate::alloc::{AllocError, NodeAlloc, SystemNodeAlloc};
use crate::stack::{LockFreeStack, Node};


/// Upper bound on the footprint of one node block.
///
/// Small enough that a block is one or two cache-line clusters, large
/// enough that one allocator call amortizes over many leases.
pub(crate) const MAX_BLOCK_SIZE: usize = 512;

/// How many nodes fit in a block alongside the header link.
pub(crate) const fn nodes_per_block<T>() -> usize {
    (MAX_BLOCK_SIZE - mem::size_of::<*mut u8>()) / mem::size_of::<Node<T>>()
}

/// Block-list link, laid out at the start of every block allocation.
#[repr(C)]
pub(crate) struct BlockHdr {
    next: *mut BlockHdr,
}

/// Layout of one block and the byte offset of its node array.
pub(crate) fn block_layout<T>() -> (Layout, usize) {
    let hdr = Layout::new::<BlockHdr>();
    let nodes = Layout::array::<Node<T>>(nodes_per_block::<T>()).unwrap();
    let (layout, offset) = hdr.extend(nodes).unwrap();
    (layout.pad_to_align(), offset)
}

/// First node of the block starting at `hdr`.
///
/// safety: `hdr` must point at a live block carved by [PoolCore]
pub(crate) unsafe fn block_nodes<T>(hdr: *mut BlockHdr) -> *mut Node<T> {
    let (_, offset) = block_layout::<T>();
    (hdr as *mut u8).add(offset) as *mut Node<T>
}

/// Block list state guarded by the admission gate.
struct BlockList {
    head: *mut BlockHdr,
    count: usize,
}

/// Shared core of [ObjectPool] and [crate::race_free::RaceFree]:
/// stack + arena + admission gate.
pub(crate) struct PoolCore<T, A: NodeAlloc> {
    stack: LockFreeStack<T>,
    /// The gate serializes *allocation* only; pops and pushes never
    /// take it. It doubles as the lock for the block-list links.
    blocks: Mutex<BlockList>,
    alloc: A,
}

// safety: nodes move between threads through the stack (ownership
// transfer), and &T is only ever derived from an exclusively owned
// handle --> T: Send suffices for both
unsafe impl<T: Send, A: NodeAlloc> Send for PoolCore<T, A> {}
unsafe impl<T: Send, A: NodeAlloc> Sync for PoolCore<T, A> {}

impl<T: Default, A: NodeAlloc> PoolCore<T, A> {
    pub(crate) fn new_in(alloc: A) -> Self {
        const {
            assert!(
                nodes_per_block::<T>() > 1,
                "element type too large for a 512-byte node block"
            );
        }
        Self {
            stack: LockFreeStack::new(),
            blocks: Mutex::new(BlockList {
                head: ptr::null_mut(),
                count: 0,
            }),
            alloc,
        }
    }

    /// Take exclusive ownership of one node.
    ///
    /// Fast path is a lock-free pop. On empty, serialize under the gate,
    /// re-check (another thread may have replenished the stack while we
    /// waited), and only then burn an allocator call.
    pub(crate) fn acquire(&self) -> Result<NonNull<Node<T>>, AllocError> {
        if let Some(node) = self.stack.pop() {
            return Ok(node);
        }

        // a panicking T::default() poisons the gate, but the block list
        // is only ever linked after full construction, so the state
        // behind a poisoned gate is still consistent
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(node) = self.stack.pop() {
            return Ok(node);
        }
        self.allocate_block(&mut blocks)
    }

    /// Carve one fresh block, publish nodes `1..` to the stack, and hand
    /// node `0` to the caller. Must be called with the gate held.
    fn allocate_block(&self, blocks: &mut BlockList) -> Result<NonNull<Node<T>>, AllocError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "pool::allocate_block",
            nodes = nodes_per_block::<T>(),
            "type" = std::any::type_name::<T>()
        );
        let _span_enter = trace_span.enter();

        let k = nodes_per_block::<T>();
        let (layout, _) = block_layout::<T>();
        let raw = self.alloc.allocate(layout)?;
        let hdr = raw.as_ptr() as *mut BlockHdr;
        // safety: raw has the layout block_layout computed the offset for
        let nodes = unsafe { block_nodes::<T>(hdr) };

        {
            // T::default() may panic; tear down the constructed prefix and
            // hand the memory back before propagating, leaving the pool
            // in its pre-call state
            struct InitGuard<'a, T, A: NodeAlloc> {
                alloc: &'a A,
                raw: NonNull<u8>,
                layout: Layout,
                nodes: *mut Node<T>,
                constructed: usize,
            }
            impl<T, A: NodeAlloc> Drop for InitGuard<'_, T, A> {
                fn drop(&mut self) {
                    unsafe {
                        for i in 0..self.constructed {
                            ptr::drop_in_place(self.nodes.add(i));
                        }
                        self.alloc.deallocate(self.raw, self.layout);
                    }
                }
            }

            let mut guard = InitGuard {
                alloc: &self.alloc,
                raw,
                layout,
                nodes,
                constructed: 0,
            };
            for i in 0..k {
                // safety: i-th slot of the freshly allocated node array
                unsafe { ptr::write(nodes.add(i), Node::new(T::default())) };
                guard.constructed += 1;
            }
            mem::forget(guard);
        }

        // register the block; the gate we hold is the lock for these links
        unsafe { (*hdr).next = blocks.head };
        blocks.head = hdr;
        blocks.count += 1;

        // thread nodes 1..k-1 through their links and splice the chain
        // onto the stack in one swap; node 0 is kept for the caller
        unsafe {
            for i in 1..k - 1 {
                (*nodes.add(i)).next.store(nodes.add(i + 1), Ordering::Relaxed);
            }
            self.stack.push_chain(
                NonNull::new_unchecked(nodes.add(1)),
                NonNull::new_unchecked(nodes.add(k - 1)),
            );
        }

        tracing::event!(
            Level::TRACE,
            block = ?hdr,
            block_count = blocks.count
        );

        // safety: nodes is non-null, node 0 was never published
        Ok(unsafe { NonNull::new_unchecked(nodes) })
    }
}

impl<T, A: NodeAlloc> PoolCore<T, A> {
    pub(crate) fn stack(&self) -> &LockFreeStack<T> {
        &self.stack
    }

    /// Head of the block list. Links behind it only ever change under
    /// the gate, and blocks are never unlinked before destruction, so a
    /// captured head stays valid for the pool's lifetime.
    pub(crate) fn blocks_head(&self) -> *mut BlockHdr {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .head
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }
}

/// Next block after `hdr` on the block list.
///
/// safety: `hdr` must point at a live block carved by a [PoolCore]
pub(crate) unsafe fn block_next(hdr: *mut BlockHdr) -> *mut BlockHdr {
    (*hdr).next
}

impl<T, A: NodeAlloc> Drop for PoolCore<T, A> {
    fn drop(&mut self) {
        // &mut self: no handles are live (they borrow the pool), so every
        // node can be destroyed no matter whether it sits on the stack.
        // walking newest-first frees blocks in reverse insertion order
        let k = nodes_per_block::<T>();
        let (layout, _) = block_layout::<T>();
        let blocks = self
            .blocks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let mut cur = blocks.head;
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next;
                let nodes = block_nodes::<T>(cur);
                for i in 0..k {
                    ptr::drop_in_place(nodes.add(i));
                }
                self.alloc
                    .deallocate(NonNull::new_unchecked(cur as *mut u8), layout);
                cur = next;
            }
        }
    }
}

/// A concurrent pool of default-constructed `T`s.
///
/// [lease](Self::lease) hands out exclusive [Lease]s that return their
/// node to the pool on drop; [lease_all](Self::lease_all) drains every
/// currently available node into one [Snapshot]. The pool is `Sync` for
/// `T: Send`: values cross threads only by ownership transfer through
/// the stack, never as shared references.
///
/// Memory grows monotonically (one 512-byte block at a time) and is
/// released only when the pool is dropped; the borrow on the handles
/// makes dropping a pool with live leases a compile error.
pub struct ObjectPool<T: Default, A: NodeAlloc = SystemNodeAlloc> {
    core: PoolCore<T, A>,
}

impl<T: Default> ObjectPool<T> {
    pub fn new() -> Self {
        Self::new_in(SystemNodeAlloc)
    }
}

impl<T: Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default, A: NodeAlloc> ObjectPool<T, A> {
    /// Create a pool drawing its blocks from `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Self {
            core: PoolCore::new_in(alloc),
        }
    }

    /// Exclusive lease of one pooled object.
    ///
    /// Errors only if the pool was empty *and* the allocator refused a
    /// new block; the pool is unchanged in that case.
    pub fn lease(&self) -> Result<Lease<'_, T>, AllocError> {
        let node = self.core.acquire()?;
        Ok(Lease {
            owner: self.core.stack(),
            node,
        })
    }

    /// Drain every currently available object into one snapshot.
    ///
    /// Objects leased out at the moment of the swap are unaffected; they
    /// return to the (now empty) stack as their leases drop.
    pub fn lease_all(&self) -> Snapshot<'_, T> {
        let head = self.core.stack().drain();
        Snapshot {
            owner: self.core.stack(),
            head: head.map_or(ptr::null_mut(), NonNull::as_ptr),
        }
    }

    /// Number of currently available (not leased) objects.
    ///
    /// Debug aid; `&mut self` because the walk is only meaningful while
    /// nothing else is touching the stack.
    pub fn size(&mut self) -> usize {
        let mut count = 0;
        let mut cur = self.core.stack().load().head() as *mut Node<T>;
        while !cur.is_null() {
            count += 1;
            cur = unsafe { (*cur).next.load(Ordering::Relaxed) };
        }
        count
    }

    /// Number of blocks the arena has allocated so far.
    pub fn block_count(&self) -> usize {
        self.core.block_count()
    }
}

impl<T: Default, A: NodeAlloc> Debug for ObjectPool<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // don't walk anything, we don't know who else is running
        f.debug_struct("ObjectPool")
            .field("@addr", &(self as *const _))
            .field("block_count", &self.core.block_count())
            .finish()
    }
}

/// Exclusive RAII lease of one pooled object.
///
/// Dropping the lease pushes the node back onto its originating pool's
/// stack; there is no other way to end a lease, so release is
/// guaranteed. Not clonable.
pub struct Lease<'pool, T> {
    owner: &'pool LockFreeStack<T>,
    node: NonNull<Node<T>>,
}

impl<T> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: the node is exclusively ours until drop
        unsafe { &self.node.as_ref().value }
    }
}

impl<T> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // safety: the node is exclusively ours until drop, and no &Node
        // outlives this call
        unsafe { &mut (*self.node.as_ptr()).value }
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        self.owner.push(self.node);
    }
}

impl<T: Debug> Debug for Lease<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&**self).finish()
    }
}

/// RAII owner of a whole drained chain of pool nodes.
///
/// Obtained from [ObjectPool::lease_all]. The chain is privately owned,
/// so it can be iterated without any synchronization; iterator lifetimes
/// are tied to the snapshot. Dropping the snapshot walks to the tail and
/// splices the entire chain back onto the stack in one swap.
pub struct Snapshot<'pool, T> {
    owner: &'pool LockFreeStack<T>,
    head: *mut Node<T>,
}

impl<T> Snapshot<'_, T> {
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn iter(&self) -> SnapshotIter<'_, T> {
        SnapshotIter {
            cur: self.head,
            _p: PhantomData,
        }
    }

    pub fn iter_mut(&mut self) -> SnapshotIterMut<'_, T> {
        SnapshotIterMut {
            cur: self.head,
            _p: PhantomData,
        }
    }
}

impl<T> Drop for Snapshot<'_, T> {
    fn drop(&mut self) {
        if self.head.is_null() {
            // nothing was available when the snapshot was taken
            return;
        }
        // the chain is stable (privately owned), so the tail walk needs
        // no synchronization
        let mut tail = self.head;
        unsafe {
            loop {
                let next = (*tail).next.load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                tail = next;
            }
            self.owner.push_chain(
                NonNull::new_unchecked(self.head),
                NonNull::new_unchecked(tail),
            );
        }
    }
}

impl<'s, T> IntoIterator for &'s Snapshot<'_, T> {
    type Item = &'s T;
    type IntoIter = SnapshotIter<'s, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'s, T> IntoIterator for &'s mut Snapshot<'_, T> {
    type Item = &'s mut T;
    type IntoIter = SnapshotIterMut<'s, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<T: Debug> Debug for Snapshot<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Forward iterator over a [Snapshot]'s chain.
pub struct SnapshotIter<'s, T> {
    cur: *const Node<T>,
    _p: PhantomData<&'s T>,
}

impl<'s, T> Iterator for SnapshotIter<'s, T> {
    type Item = &'s T;

    fn next(&mut self) -> Option<&'s T> {
        if self.cur.is_null() {
            return None;
        }
        // safety: the chain is owned by the snapshot this iterator
        // borrows, and links on an owned chain don't move
        unsafe {
            let node = &*self.cur;
            self.cur = node.next.load(Ordering::Relaxed);
            Some(&node.value)
        }
    }
}

/// Like [SnapshotIter], but yields exclusive references.
pub struct SnapshotIterMut<'s, T> {
    cur: *mut Node<T>,
    _p: PhantomData<&'s mut T>,
}

impl<'s, T> Iterator for SnapshotIterMut<'s, T> {
    type Item = &'s mut T;

    fn next(&mut self) -> Option<&'s mut T> {
        if self.cur.is_null() {
            return None;
        }
        // safety: &mut Snapshot is exclusive and each node is visited
        // exactly once, so the yielded &mut never alias
        unsafe {
            let node = self.cur;
            self.cur = (*node).next.load(Ordering::Relaxed);
            Some(&mut (*node).value)
        }
    }
}
