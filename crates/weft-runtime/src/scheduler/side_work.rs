//! Ad-hoc work submitted from inside (or outside) tasks.
//!
//! Side work bypasses the DAG entirely: items are arena-allocated closures
//! pushed onto one of four unbounded lanes, one per [`Priority`]. Workers
//! drain the highest non-empty lane first, so priority here orders dispatch
//! instead of touching OS thread priorities.

use weft_core::sync::SegQueue;

use crate::task::Priority;

/// An arena-allocated side-work item. The lanes carry its address.
pub(crate) struct QueuedWork {
    pub job: Box<dyn FnOnce() + Send + 'static>,
}

/// Four unbounded queues, one per priority level.
pub(crate) struct SideWorkLanes {
    lanes: [SegQueue<usize>; Priority::COUNT],
}

impl SideWorkLanes {
    pub fn new(segment_capacity: usize, retire_threshold: usize) -> Self {
        Self {
            lanes: std::array::from_fn(|_| {
                SegQueue::with_capacity_and_threshold(segment_capacity, retire_threshold)
            }),
        }
    }

    /// Enqueue a work item's address at the given priority.
    pub fn push(&self, addr: usize, priority: Priority) {
        self.lanes[priority.as_index()].push(addr);
    }

    /// Dequeue the highest-priority available address.
    pub fn pop(&self) -> Option<usize> {
        for lane in self.lanes.iter().rev() {
            if let Some(addr) = lane.pop() {
                return Some(addr);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.is_empty())
    }
}
