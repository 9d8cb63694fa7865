//! ABA-safe lock-free stack of intrusive nodes
//!
//! This is the one shared mutable cell on the hot path of the pool
//! containers: a Treiber stack whose top is a 128-bit `{tag, address}`
//! pair swapped with a double-width compare-exchange.
//!
//! A plain pointer CAS is vulnerable to ABA: a popper reads top `A` and
//! `A.next == B`, stalls, another thread pops `A`, pops `B`, pushes `A`
//! back, and the stalled CAS then succeeds even though `B` is long gone
//! from the stack (it is leased out, and splicing it back in loses or
//! duplicates nodes). Pairing the address with a tag that every winner
//! bumps by exactly 1 makes each successful swap globally unique, so a
//! stale snapshot can never win:
//!
//! ```text
//!               127            64 63             0
//!              +-----------------+----------------+
//!    top_:     |      tag        |     head       |   (16-byte atomic)
//!              +-----------------+----------------+
//!                                       |
//!                                       v
//!                                  +--------+     +--------+
//!                                  | node   | --> | node   | --> (null)
//!                                  +--------+     +--------+
//! ```
//!
//! 64 bits of tag give enough headroom that wrapping can be ignored over
//! any realistic runtime.
//!
//! The double-width CAS (`cmpxchg16b` on x86-64, `casp`/LL-SC pairs on
//! AArch64) comes from [portable_atomic::AtomicU128]; this module is the
//! only place in the crate that touches it.

use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use portable_atomic::AtomicU128;

#[cfg(test)]
mod tests;

/// One slot of a pool container: the value plus the intrusive link.
///
/// `next` is only meaningful while the node is on the stack (or on a
/// privately owned drained chain); it is an atomic because a slow popper
/// may read the link of a node that a faster thread has already popped
/// and reused. Such a read is never *acted* on (the tag CAS fails), but
/// it must still be a defined load.
pub(crate) struct Node<T> {
    pub(crate) value: T,
    pub(crate) next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// `{tag, address}` packed for the double-width CAS.
///
/// Bits [63:0] hold the full 64-bit node address (no stolen bits, no
/// assumptions about virtual-address width), bits [127:64] the tag.
/// Equality is equality of all 128 bits.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct TaggedPtr(u128);

impl TaggedPtr {
    pub(crate) const NULL: Self = Self(0);

    #[inline]
    fn pack(head: *mut (), tag: u64) -> Self {
        Self((tag as u128) << 64 | head as usize as u128)
    }

    #[inline]
    pub(crate) fn head(self) -> *mut () {
        self.0 as usize as *mut ()
    }

    #[inline]
    pub(crate) fn tag(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

impl Debug for TaggedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedPtr({:p}, tag={})", self.head(), self.tag())
    }
}

/// Lock-free LIFO of [Node]s, ABA-safe via the monotonic tag.
///
/// The stack never owns node memory; nodes live in an arena (pool case)
/// or wherever the caller allocated them, and are guaranteed by the
/// containers to outlive the stack. That is the entire reclamation
/// story: nothing is freed while the stack can still be reached, so no
/// hazard pointers or epochs are needed.
pub(crate) struct LockFreeStack<T> {
    top_: AtomicU128,
    _p: PhantomData<*mut Node<T>>,
}

// safety: the stack only moves *ownership* of nodes between threads
// (push on one thread, pop on another), it never shares &T
// --> require Send, not Sync
unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    pub(crate) const fn new() -> Self {
        Self {
            top_: AtomicU128::new(0),
            _p: PhantomData,
        }
    }

    /// Snapshot the top of the stack.
    ///
    /// order: acquire, so that a caller who walks the chain starting at
    /// the returned head sees the node contents published by pushers
    pub(crate) fn load(&self) -> TaggedPtr {
        TaggedPtr(self.top_.load(Ordering::Acquire))
    }

    /// Push one privately owned node.
    pub(crate) fn push(&self, node: NonNull<Node<T>>) {
        self.push_chain(node, node);
    }

    /// Splice a privately owned chain `head -> .. -> tail` onto the stack.
    ///
    /// The caller must be the exclusive owner of every node on the chain
    /// and the internal `next` links of `head..tail` must already be
    /// threaded; only `tail.next` is (re)written here.
    pub(crate) fn push_chain(&self, head: NonNull<Node<T>>, tail: NonNull<Node<T>>) {
        // order: the load can be relaxed; the release CAS below is what
        // publishes both the chain contents and the new top
        let mut old = TaggedPtr(self.top_.load(Ordering::Relaxed));
        loop {
            // still private, but the link must be an atomic store: a slow
            // popper holding a stale snapshot may race a read of it
            unsafe {
                tail.as_ref()
                    .next
                    .store(old.head() as *mut Node<T>, Ordering::Relaxed);
            }
            let new = TaggedPtr::pack(head.as_ptr() as *mut (), old.tag().wrapping_add(1));
            // order: release on success so that poppers (and drainers)
            // acquire-loading the new top see the chain contents.
            // failure can be relaxed, nothing read from `old` is
            // dereferenced on the push path
            match self.top_.compare_exchange_weak(
                old.0,
                new.0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => old = TaggedPtr(seen),
            }
        }
    }

    /// Pop the top node, or `None` if the stack is observed empty.
    pub(crate) fn pop(&self) -> Option<NonNull<Node<T>>> {
        let mut old = self.load();
        loop {
            let head = old.head() as *mut Node<T>;
            if head.is_null() {
                return None;
            }
            // this read may observe a link of a node that another thread
            // has already popped and begun reusing; the CAS below fails
            // on the tag in that case, so the stale value is never used
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            let new = TaggedPtr::pack(next as *mut (), old.tag().wrapping_add(1));
            // order: acquire on success to synchronize-with the release
            // push that published `head`, making its value visible before
            // the caller dereferences it. acquire on failure because the
            // retry dereferences the newly observed head
            match self.top_.compare_exchange_weak(
                old.0,
                new.0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                // safety: head was non-null and the tag matched, so it is
                // exclusively ours now
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(head) }),
                Err(seen) => old = TaggedPtr(seen),
            }
        }
    }

    /// Take the entire chain in one swap, or `None` if already empty.
    ///
    /// The chain keeps its internal order; the caller becomes the
    /// exclusive owner of every node on it.
    pub(crate) fn drain(&self) -> Option<NonNull<Node<T>>> {
        let mut old = self.load();
        loop {
            if old.head().is_null() {
                return None;
            }
            let new = TaggedPtr::pack(ptr::null_mut(), old.tag().wrapping_add(1));
            // order: acquire on success, the caller will walk the whole
            // chain and must see every prior push
            match self.top_.compare_exchange_weak(
                old.0,
                new.0,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(old.head() as *mut Node<T>),
                Err(seen) => old = TaggedPtr(seen),
            }
        }
    }
}

impl<T> Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // don't walk the chain, we don't know who else is running
        f.debug_struct("LockFreeStack")
            .field("@addr", &(self as *const _))
            .field("top_", &self.load())
            .finish()
    }
}
