//! weft-runtime: task-parallel scheduling engine with typed dataflow.
//!
//! The scheduler accepts user closures as tasks, arranges them in a
//! dependency DAG, runs them across a pool of OS threads, and pipes each
//! task's return value into its dependents as typed inputs.
//!
//! # Example
//!
//! ```
//! use weft_runtime::{Scheduler, TaskToken};
//!
//! let scheduler = Scheduler::new();
//! let a = scheduler.add_task(|_: &mut TaskToken| 7i64);
//! let a_id = a.id();
//! let b = scheduler.add_task(move |t: &mut TaskToken| {
//!     let x = t.arg::<i64>(a_id).unwrap().take();
//!     x + 1
//! });
//! b.depends_on(&[a]).unwrap();
//! scheduler.run().unwrap();
//! assert_eq!(scheduler.get_result::<i64>(b).unwrap(), 8);
//! ```

pub mod awaiter;
pub mod channel;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod token;

pub use awaiter::Awaiter;
pub use channel::{BoundedChannel, Channel, ChannelQueue, UnboundedChannel};
pub use observability::{MetricsCollector, SchedulerMetrics};
pub use pipeline::{pipeline, Pipeline};
pub use scheduler::worker::this_thread;
pub use scheduler::{DependencyTracker, Scheduler};
pub use store::ValueStore;
pub use task::{ErrorHandler, PanicPayload, Priority, Task, TaskResult};
pub use token::TaskToken;

// Re-export the core surface so downstream crates only depend on one name.
pub use weft_core::{
    alloc::{BlockAllocator, BumpArena},
    cow::CowCell,
    error::{ChannelError, SchedulerError, TaskError, ValueStoreError},
    sync::{AtomicDWord, HazardDomain, RingBuffer, SegQueue, SignalTree, Waiter, Word},
    SchedulerConfig, TaskId,
};
