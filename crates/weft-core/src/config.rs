//! Scheduler configuration.
//!
//! Controls worker-pool sizing and the capacity knobs of the internal
//! structures. All fields have serde defaults so a partial configuration
//! file deserializes into something runnable.

use serde::{Deserialize, Serialize};

use crate::util::{is_power_of_two, next_power_of_two};

/// Configuration for a [`Scheduler`](../../weft_runtime/struct.Scheduler.html).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads in the pool.
    ///
    /// Default: number of logical CPUs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of a single signal tree (power of two).
    ///
    /// The scheduler chains as many trees as the task table needs, so this
    /// only tunes the granularity of the ready-set structure.
    ///
    /// Default: 256
    #[serde(default = "default_tree_capacity")]
    pub tree_capacity: usize,

    /// Size in bytes of one arena block in the block allocator.
    ///
    /// Default: 2 MiB
    #[serde(default = "default_arena_block_size")]
    pub arena_block_size: usize,

    /// Ring capacity of one segment of the side-work queues (power of two).
    ///
    /// Default: 128
    #[serde(default = "default_side_work_segment")]
    pub side_work_segment: usize,

    /// Number of retired nodes that triggers a hazard-pointer reclamation
    /// scan in the internal queues.
    ///
    /// Default: 1000
    #[serde(default = "default_hazard_retire_threshold")]
    pub hazard_retire_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tree_capacity: default_tree_capacity(),
            arena_block_size: default_arena_block_size(),
            side_work_segment: default_side_work_segment(),
            hazard_retire_threshold: default_hazard_retire_threshold(),
        }
    }
}

impl SchedulerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker-thread count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-tree slot capacity.
    pub fn with_tree_capacity(mut self, tree_capacity: usize) -> Self {
        self.tree_capacity = tree_capacity;
        self
    }

    /// Set the arena block size in bytes.
    pub fn with_arena_block_size(mut self, bytes: usize) -> Self {
        self.arena_block_size = bytes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if !is_power_of_two(self.tree_capacity) {
            return Err("tree_capacity must be a power of two".to_string());
        }
        if !is_power_of_two(self.side_work_segment) {
            return Err("side_work_segment must be a power of two".to_string());
        }
        if self.arena_block_size < 4096 {
            return Err("arena_block_size must be at least 4096 bytes".to_string());
        }
        if self.hazard_retire_threshold == 0 {
            return Err("hazard_retire_threshold must be > 0".to_string());
        }
        Ok(())
    }

    /// A copy with every out-of-range field clamped to the nearest legal
    /// value. The scheduler normalizes its configuration on construction so
    /// a sloppy config degrades instead of failing.
    pub fn normalized(&self) -> Self {
        Self {
            workers: self.workers.max(1),
            tree_capacity: next_power_of_two(self.tree_capacity.max(2)),
            arena_block_size: self.arena_block_size.max(4096),
            side_work_segment: next_power_of_two(self.side_work_segment.max(2)),
            hazard_retire_threshold: self.hazard_retire_threshold.max(1),
        }
    }
}

// Default functions for serde

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_tree_capacity() -> usize {
    256
}

fn default_arena_block_size() -> usize {
    2 * 1024 * 1024
}

fn default_side_work_segment() -> usize {
    128
}

fn default_hazard_retire_threshold() -> usize {
    1000
}
