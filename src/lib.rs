//! Concurrent containers for parallel accumulation and object reuse
//!
//! Three containers that let worker threads produce partial results
//! without contending on shared state, and let one thread collect
//! everything afterwards:
//!
//! * [Tls](tls::Tls): one lazily-created value per calling thread,
//!   with bulk iteration over all of them (fold the partial results)
//! * [ObjectPool](pool::ObjectPool): exclusive leases of
//!   default-constructed objects, recycled on release; a drained
//!   [Snapshot](pool::Snapshot) collects everything at once
//! * [RaceFree](race_free::RaceFree): like the pool, but every slot is
//!   an `Option<T>` the holder may fill, accumulate into, or clear
//!
//! The interesting part is the shared core: a Treiber stack whose top is
//! a 128-bit `{tag, pointer}` swapped with a double-width CAS (the tag
//! defeats ABA, see the stack module docs), a block arena that feeds the
//! stack dozens
//! of nodes per allocator call, and, for the TLS case, a sharded
//! owner-keyed list with a separate traversal spine. Reclamation is
//! deliberately primitive: nodes live until their container dies, so no
//! reader can ever observe freed memory and the hot paths carry zero
//! reclamation overhead.
//!
//! Cross-thread mutation funnels through exactly one atomic cell per
//! container (the stack top / list heads); everything else happens on
//! privately owned nodes. Iteration, `clear` and `reset` want the world
//! stopped; those take `&mut self`, so the "no concurrent mutation"
//! preconditions are borrow-checked instead of documented.

// the stack top is a 16-byte {tag, pointer} pair; anything narrower than
// a 64-bit pointer would leave tag bits on the table (and 32-bit targets
// rarely have a 128-bit CAS to begin with)
#[cfg(not(target_pointer_width = "64"))]
compile_error!("this crate requires 64-bit pointers and a 128-bit compare-exchange");

pub mod alloc;
mod loom_testing;
pub mod pool;
pub mod race_free;
mod stack;
pub mod tls;

pub use crate::alloc::{AllocError, NodeAlloc, SystemNodeAlloc};
pub use crate::pool::{Lease, ObjectPool, Snapshot};
pub use crate::race_free::{RaceFree, Slot};
pub use crate::tls::{Initializer, Tls};
