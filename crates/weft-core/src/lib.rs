//! Core types and lock-free primitives for the weft task scheduler.
//!
//! This crate holds everything below the scheduler itself:
//! - **Identifiers and errors**: [`TaskId`], the public error taxonomy.
//! - **Configuration**: [`SchedulerConfig`] with serde support.
//! - **Lock-free toolbox** ([`sync`]): the double-word atomic, the bounded
//!   MPMC ring, the unbounded segmented queue, the hazard-pointer domain and
//!   the signal tree.
//! - **Memory** ([`alloc`]): the bump arena and the block allocator that back
//!   value-store payloads and queued side work.
//! - **Small utilities**: [`CowCell`], the [`sync::Waiter`] condvar shell.

pub mod alloc;
pub mod config;
pub mod cow;
pub mod error;
pub mod sync;
pub mod task_id;
pub mod util;

pub use config::SchedulerConfig;
pub use cow::CowCell;
pub use error::{ChannelError, SchedulerError, TaskError, ValueStoreError};
pub use task_id::TaskId;
