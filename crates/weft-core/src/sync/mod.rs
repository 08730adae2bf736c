//! Lock-free building blocks.
//!
//! Everything here is independent of the scheduler: the double-word atomic,
//! the bounded MPMC ring, the unbounded segmented queue with hazard-pointer
//! reclamation, the signal tree, and the condvar [`Waiter`].

pub mod dword;
pub mod hazard;
pub mod queue;
pub mod ring;
pub mod signal_tree;
pub mod waiter;

pub use dword::AtomicDWord;
pub use hazard::{HazardDomain, HazardGuard};
pub use queue::SegQueue;
pub use ring::{RingBuffer, Word};
pub use signal_tree::SignalTree;
pub use waiter::Waiter;
