//! Scoped thread-local storage with bulk iteration
//!
//! One value of type `T` per calling thread, materialized lazily by an
//! [Initializer] on the thread's first [local](Tls::local) call, then
//! folded together later by iterating the whole container from one
//! thread.
//!
//! Lookup is kept away from a single contended list by sharding on the
//! caller's thread id:
//!
//! ```text
//!   shards[hash(tid) % N]  ->  node -> node -> (null)      per-shard list
//!   shards[...]            ->  node -> (null)
//!   spine                  ->  node -> node -> node -> ..   every node
//! ```
//!
//! Every node lives on exactly one shard list *and* on the spine. The
//! shard list makes `local()` walk only O(threads/N) nodes; the spine
//! makes iteration a single linked-list walk instead of a scan over N
//! mostly-empty shard heads. The two prepends are separate CAS loops,
//! not one atomic composite; an iterator racing between them could miss
//! the newest node, which is fine because iteration is contractually
//! not concurrent with `local()` (shared iteration additionally demands
//! `T: Sync`, see [Tls::iter]).
//!
//! Nodes are never unlinked individually. [clear](Tls::clear) (and drop)
//! empty every shard head and the spine head first, then free the
//! detached nodes; between those two steps no other access can exist
//! because clear takes `&mut self`.

use std::alloc::Layout;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use tracing::Level;

use crate::alloc::{AllocError, NodeAlloc, SystemNodeAlloc};
use crate::loom_testing::*;


/// Type-erased factory for per-thread values.
///
/// Invoked exactly once per participating thread (each call must
/// produce an independent value, hence `Fn` and not `FnOnce`). Cloning
/// shares the underlying factory, which is what lets a whole [Tls] be
/// cloned.
pub struct Initializer<T> {
    make: std::sync::Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T> Clone for Initializer<T> {
    fn clone(&self) -> Self {
        Self {
            make: self.make.clone(),
        }
    }
}

impl<T> Initializer<T> {
    /// Wrap a nullary factory.
    pub fn from_fn(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            make: std::sync::Arc::new(f),
        }
    }

    /// "Return a copy of `value`": each thread gets its own clone.
    pub fn of_value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::from_fn(move || value.clone())
    }

    /// "Default-construct a `T`".
    pub fn of_default() -> Self
    where
        T: Default + 'static,
    {
        Self::from_fn(T::default)
    }

    fn invoke(&self) -> T {
        (self.make)()
    }
}

impl<T> Debug for Initializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Initializer").finish_non_exhaustive()
    }
}

struct TlsNode<T> {
    value: T,
    owner: ThreadId,
    /// next node in the same shard; immutable once the node is published
    shard_next: *mut TlsNode<T>,
    /// next node on the spine; immutable once the node is published
    spine_next: *mut TlsNode<T>,
}

/// Per-thread scoped storage.
///
/// `local()` returns a shared reference: handing out `&mut T` would let
/// a second `local()` call on the same thread alias it. Workers mutate
/// through interior mutability (`Cell`, atomics, ...); exclusive access
/// to everything at once is available through [iter_mut](Self::iter_mut)
/// once the parallel phase is over.
///
/// The container is `Sync` for `T: Send`: concurrent `local()` calls
/// only ever touch their own thread's value. Sharing values *across*
/// threads is what [iter](Self::iter) does, and that alone requires
/// `T: Sync`.
pub struct Tls<T, A: NodeAlloc = SystemNodeAlloc> {
    shards: Box<[AtomicPtr<TlsNode<T>>]>,
    spine: AtomicPtr<TlsNode<T>>,
    init: Initializer<T>,
    alloc: A,
}

// safety: a value is only reachable as &T by its owning thread via
// local(); clear/drop/iter_mut move or touch values from one thread
// while no other access exists (&mut self)
// --> require Send
// cross-thread &T only comes from iter(), which bounds T: Sync itself
unsafe impl<T: Send, A: NodeAlloc> Send for Tls<T, A> {}
unsafe impl<T: Send, A: NodeAlloc> Sync for Tls<T, A> {}

impl<T: Default + 'static> Tls<T> {
    /// Storage whose per-thread values are default-constructed.
    pub fn new() -> Self {
        Self::with_initializer(T::default)
    }
}

impl<T: Default + 'static> Default for Tls<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Tls<T> {
    /// Storage whose per-thread values are produced by `f`.
    pub fn with_initializer(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_initializer_in(f, SystemNodeAlloc)
    }

    /// Storage whose per-thread values are clones of `value`.
    pub fn with_value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::from_parts(Initializer::of_value(value), SystemNodeAlloc)
    }
}

impl<T, A: NodeAlloc> Tls<T, A> {
    /// Like [with_initializer](Tls::with_initializer), with an explicit
    /// node allocator. The allocator is called concurrently whenever the
    /// container is.
    pub fn with_initializer_in(f: impl Fn() -> T + Send + Sync + 'static, alloc: A) -> Self {
        Self::from_parts(Initializer::from_fn(f), alloc)
    }

    /// Assemble from an [Initializer] and an allocator.
    pub fn from_parts(init: Initializer<T>, alloc: A) -> Self {
        let nshards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let shards = (0..nshards)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            shards,
            spine: AtomicPtr::new(ptr::null_mut()),
            init,
            alloc,
        }
    }

    fn shard_of(&self, tid: ThreadId) -> &AtomicPtr<TlsNode<T>> {
        let mut hasher = rustc_hash::FxHasher::default();
        tid.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Access the calling thread's value, creating it on first use.
    ///
    /// Returns the value and whether this very call created it. Errors
    /// only if the node allocator refused memory; a panicking
    /// initializer propagates. Either way nothing is linked and the
    /// container is unchanged.
    pub fn local(&self) -> Result<(&T, bool), AllocError> {
        let tid = current_thread_id();
        let shard = self.shard_of(tid);

        // order: acquire so the walk sees the contents of nodes
        // published by other threads' release CAS below
        let mut cur = shard.load(Ordering::Acquire);
        while !cur.is_null() {
            // safety: published nodes stay alive until clear/drop, which
            // cannot run concurrently (&mut self)
            let node = unsafe { &*cur };
            if node.owner == tid {
                return Ok((&node.value, false));
            }
            cur = node.shard_next;
        }

        // first touch by this thread
        self.create_local(tid, shard)
    }

    /// `local()` miss path: allocate, initialize, publish.
    #[inline(never)]
    fn create_local(
        &self,
        tid: ThreadId,
        shard: &AtomicPtr<TlsNode<T>>,
    ) -> Result<(&T, bool), AllocError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "tls::create_local",
            "type" = std::any::type_name::<T>()
        );
        let _span_enter = trace_span.enter();

        let layout = Layout::new::<TlsNode<T>>();
        let raw = self.alloc.allocate(layout)?;
        let node = raw.as_ptr() as *mut TlsNode<T>;

        {
            // the initializer may panic; hand the node back before
            // propagating so the container stays in its pre-call state
            struct DeallocGuard<'a, A: NodeAlloc> {
                alloc: &'a A,
                raw: NonNull<u8>,
                layout: Layout,
            }
            impl<A: NodeAlloc> Drop for DeallocGuard<'_, A> {
                fn drop(&mut self) {
                    // safety: raw came from this allocator with this
                    // layout and holds no initialized value yet
                    unsafe { self.alloc.deallocate(self.raw, self.layout) };
                }
            }

            let guard = DeallocGuard {
                alloc: &self.alloc,
                raw,
                layout,
            };
            let value = self.init.invoke();
            mem::forget(guard);
            // safety: raw is valid for a TlsNode<T> and unpublished
            unsafe {
                ptr::write(
                    node,
                    TlsNode {
                        value,
                        owner: tid,
                        shard_next: ptr::null_mut(),
                        spine_next: ptr::null_mut(),
                    },
                );
            }
        }

        // publish to the shard list...
        // order: release on success so that walkers acquiring the head
        // see the node fields; the rewrite of shard_next on retry is
        // fine, the node is still private
        let mut head = shard.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).shard_next = head };
            match shard.compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(seen) => {
                    head = seen;
                    spin_hint();
                }
            }
        }

        // ...then to the spine. not one atomic composite with the shard
        // prepend; see the module docs for why that is allowed
        let mut head = self.spine.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).spine_next = head };
            match self
                .spine
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(seen) => {
                    head = seen;
                    spin_hint();
                }
            }
        }

        tracing::event!(Level::TRACE, node = ?node);

        // safety: the node is live until clear/drop
        Ok((unsafe { &(*node).value }, true))
    }

    /// Iterate every thread's value from one thread, newest first.
    ///
    /// `T: Sync` because this exposes values created by other threads as
    /// shared references.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Sync,
    {
        Iter {
            // order: acquire pairs with the spine release CAS
            cur: self.spine.load(Ordering::Acquire),
            _p: PhantomData,
        }
    }

    /// Iterate with exclusive access, newest first.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        IterMut {
            cur: self.spine.load(Ordering::Acquire),
            _p: PhantomData,
        }
    }

    /// Destroy and free every per-thread value.
    ///
    /// The next `local()` call of any thread creates afresh. `&mut self`
    /// rules out concurrent access.
    pub fn clear(&mut self) {
        tracing::event!(Level::TRACE, "tls::clear");

        // empty every head before freeing anything, so no dangling node
        // is reachable even transiently
        for shard in self.shards.iter() {
            shard.store(ptr::null_mut(), Ordering::Relaxed);
        }
        let mut cur = self.spine.swap(ptr::null_mut(), Ordering::Relaxed);

        let layout = Layout::new::<TlsNode<T>>();
        while !cur.is_null() {
            // safety: the chain is detached and exclusively ours
            unsafe {
                let next = (*cur).spine_next;
                ptr::drop_in_place(cur);
                self.alloc
                    .deallocate(NonNull::new_unchecked(cur as *mut u8), layout);
                cur = next;
            }
        }
    }
}

impl<T: Clone + Sync, A: NodeAlloc + Clone> Tls<T, A> {
    /// Clone every entry into a fresh container, sharing the initializer.
    ///
    /// Entries keep their owners: a thread that had a value in `self`
    /// finds its copy in the clone without a fresh first touch. Reads
    /// other threads' values, so it carries the same `T: Sync` bound and
    /// no-concurrent-`local()` contract as [iter](Self::iter).
    pub fn try_clone(&self) -> Result<Self, AllocError> {
        let clone = Self::from_parts(self.init.clone(), self.alloc.clone());
        let layout = Layout::new::<TlsNode<T>>();

        // the spine reads newest-first; insert back-to-front so the
        // clone's spine ends up in the same order as ours
        let mut entries = Vec::new();
        let mut cur = self.spine.load(Ordering::Acquire);
        while !cur.is_null() {
            entries.push(cur);
            cur = unsafe { (*cur).spine_next };
        }

        for &src in entries.iter().rev() {
            // safety: published nodes stay alive for the borrow of self
            let src = unsafe { &*src };
            // clone the value before allocating: if either fails, the
            // partially built container just drops (and frees) itself
            let value = src.value.clone();
            let raw = clone.alloc.allocate(layout)?;
            let node = raw.as_ptr() as *mut TlsNode<T>;
            let shard = clone.shard_of(src.owner);
            // the clone is not shared yet, so plain prepends are enough
            unsafe {
                ptr::write(
                    node,
                    TlsNode {
                        value,
                        owner: src.owner,
                        shard_next: shard.load(Ordering::Relaxed),
                        spine_next: clone.spine.load(Ordering::Relaxed),
                    },
                );
            }
            shard.store(node, Ordering::Relaxed);
            clone.spine.store(node, Ordering::Relaxed);
        }
        Ok(clone)
    }
}

impl<T: Clone + Sync, A: NodeAlloc + Clone> Clone for Tls<T, A> {
    fn clone(&self) -> Self {
        // Clone has no error channel; a refusing allocator is fatal here
        match self.try_clone() {
            Ok(clone) => clone,
            Err(e) => panic!("cloning thread-local storage failed: {e}"),
        }
    }
}

impl<T, A: NodeAlloc> Drop for Tls<T, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T, A: NodeAlloc> Debug for Tls<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // don't walk the lists, we don't know who else is running
        f.debug_struct("Tls")
            .field("@addr", &(self as *const _))
            .field("shards", &self.shards.len())
            .finish()
    }
}

/// Forward iterator over all per-thread values (shared).
pub struct Iter<'a, T> {
    cur: *mut TlsNode<T>,
    _p: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.cur.is_null() {
            return None;
        }
        // safety: spine nodes stay alive for the borrow of the Tls;
        // links are immutable after publication
        unsafe {
            let node = &*self.cur;
            self.cur = node.spine_next;
            Some(&node.value)
        }
    }
}

/// Forward iterator over all per-thread values (exclusive).
pub struct IterMut<'a, T> {
    cur: *mut TlsNode<T>,
    _p: PhantomData<&'a mut T>,
}

impl<'a, T> Iterator for IterMut<'a, T> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        if self.cur.is_null() {
            return None;
        }
        // safety: &mut Tls is exclusive and each node is visited exactly
        // once, so the yielded &mut never alias
        unsafe {
            let node = self.cur;
            self.cur = (*node).spine_next;
            Some(&mut (*node).value)
        }
    }
}

impl<'a, T: Sync, A: NodeAlloc> IntoIterator for &'a Tls<T, A> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, A: NodeAlloc> IntoIterator for &'a mut Tls<T, A> {
    type Item = &'a mut T;
    type IntoIter = IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}
