//! Arena allocation for value-store payloads and queued side work.
//!
//! [`BumpArena`] is a single contiguous buffer with a monotonically growing
//! cursor; the `(refcount, cursor)` pair lives in one [`AtomicDWord`] so an
//! allocation bumps both in a single CAS, and the cursor rewinds to zero when
//! the last outstanding allocation is released. [`BlockAllocator`] chains
//! arenas: exhaustion CAS-links a fresh block, deallocation finds the owning
//! block by address containment.

mod block;
mod bump;

pub use block::{ArenaMarker, BlockAllocator};
pub use bump::BumpArena;
