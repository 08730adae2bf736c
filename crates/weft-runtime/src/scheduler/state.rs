//! Shared scheduler state and the task table.
//!
//! All coordination between the caller and the worker pool funnels through
//! [`SchedulerState`]: the task table with its signal trees (behind one
//! `RwLock`, write-locked only by graph mutation and build), the value
//! store, the side-work lanes and the two waiters.
//!
//! Slot ownership protocol: a task body is mutated by exactly one party at a
//! time: `add_task`/`depends_on` under the write lock before a run, the
//! worker that claimed the slot from a signal tree while the task runs, and
//! the finishing thread inside `on_complete`. The `pending` counter and
//! `state` tag are atomics because completion signals cross threads.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

use weft_core::alloc::BlockAllocator;
use weft_core::error::SchedulerError;
use weft_core::sync::{SignalTree, Waiter};
use weft_core::{SchedulerConfig, TaskId};

use crate::observability::MetricsCollector;
use crate::scheduler::side_work::{QueuedWork, SideWorkLanes};
use crate::scheduler::worker::PoolShared;
use crate::store::ValueStore;
use crate::task::{ErrorHandler, PanicPayload, Priority, Task};

/// Lifecycle tag of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    Empty = 0,
    Alive = 1,
    Dead = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskState::Alive,
            2 => TaskState::Dead,
            _ => TaskState::Empty,
        }
    }
}

/// Everything about a task that only its current owner touches.
pub(crate) struct TaskBody {
    pub task: Option<Task>,
    pub error_handler: Option<ErrorHandler>,
    /// Unhandled panic captured from the task, re-raised at the `run` join.
    pub panic: Option<PanicPayload>,
    /// Tasks that depend on this task's output.
    pub out_edges: Vec<TaskId>,
    /// Producers feeding this task, with the move-or-borrow decision made
    /// at build time.
    pub in_edges: Vec<(TaskId, bool)>,
    pub has_signaled: bool,
    pub priority: Priority,
}

impl TaskBody {
    fn empty() -> Self {
        Self {
            task: None,
            error_handler: None,
            panic: None,
            out_edges: Vec::new(),
            in_edges: Vec::new(),
            has_signaled: false,
            priority: Priority::Normal,
        }
    }
}

/// One entry of the task table.
pub(crate) struct TaskSlot {
    pub body: UnsafeCell<TaskBody>,
    /// Not-yet-completed producers. Zero is necessary but not sufficient
    /// for readiness; the slot must also be Alive.
    pub pending: CachePadded<AtomicU32>,
    state: AtomicU8,
}

// Safety: `body` is guarded by the slot ownership protocol described in the
// module docs; the rest is atomic.
unsafe impl Sync for TaskSlot {}
unsafe impl Send for TaskSlot {}

impl TaskSlot {
    fn empty() -> Self {
        Self {
            body: UnsafeCell::new(TaskBody::empty()),
            pending: CachePadded::new(AtomicU32::new(0)),
            state: AtomicU8::new(TaskState::Empty as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state() == TaskState::Alive
    }
}

/// The task table plus its ready-set trees, guarded by one lock.
pub(crate) struct Graph {
    pub trees: Vec<SignalTree>,
    pub slots: Vec<TaskSlot>,
}

impl Graph {
    /// Shared view of a slot body.
    ///
    /// # Safety
    /// Caller must hold a read phase of the slot ownership protocol: no
    /// concurrent mutator for this slot.
    pub unsafe fn body(&self, id: TaskId) -> &TaskBody {
        unsafe { &*self.slots[id.raw()].body.get() }
    }

    /// Exclusive view of a slot body.
    ///
    /// # Safety
    /// Caller must be the slot's current owner per the protocol.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn body_mut(&self, id: TaskId) -> &mut TaskBody {
        unsafe { &mut *self.slots[id.raw()].body.get() }
    }
}

/// State shared between the caller, the workers and every task token.
pub(crate) struct SchedulerState {
    pub cfg: SchedulerConfig,
    pub graph: RwLock<Graph>,
    /// Tasks promoted to ready and not yet completed or failed.
    pub ready: CachePadded<AtomicUsize>,
    pub running: AtomicBool,
    pub store: ValueStore,
    pub alloc: Arc<BlockAllocator>,
    pub side_work: SideWorkLanes,
    pub side_pending: AtomicUsize,
    /// Where `run` blocks until the graph drains.
    pub caller: Waiter,
    pub pool: Arc<PoolShared>,
    /// Raw id of the most recently completed task.
    pub last_done: AtomicUsize,
    pub metrics: MetricsCollector,
}

impl SchedulerState {
    pub fn new(cfg: SchedulerConfig) -> Self {
        let alloc = Arc::new(BlockAllocator::with_block_size(cfg.arena_block_size));
        Self {
            graph: RwLock::new(Graph {
                trees: Vec::new(),
                slots: Vec::new(),
            }),
            ready: CachePadded::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            store: ValueStore::new(alloc.clone()),
            side_work: SideWorkLanes::new(cfg.side_work_segment, cfg.hazard_retire_threshold),
            side_pending: AtomicUsize::new(0),
            caller: Waiter::new(),
            pool: Arc::new(PoolShared::new()),
            last_done: AtomicUsize::new(usize::MAX),
            metrics: MetricsCollector::new(),
            alloc,
            cfg,
        }
    }

    #[inline]
    fn tree_capacity(&self) -> usize {
        self.cfg.tree_capacity
    }

    #[inline]
    fn tree_position(&self, id: TaskId) -> (usize, usize) {
        (
            id.raw() / self.tree_capacity(),
            id.raw() % self.tree_capacity(),
        )
    }

    /// Mark a task's ready slot in its signal tree (Alive tasks only).
    pub fn set_signal(&self, graph: &Graph, id: TaskId) {
        if !graph.slots[id.raw()].is_alive() {
            return;
        }
        let (tree, pos) = self.tree_position(id);
        graph.trees[tree].set(pos);
    }

    /// Claim one ready task across the trees.
    pub fn pop_ready(&self, graph: &Graph) -> Option<TaskId> {
        for (i, tree) in graph.trees.iter().enumerate() {
            if let Some((pos, _)) = tree.select() {
                return Some(TaskId::from_raw(i * self.tree_capacity() + pos));
            }
        }
        None
    }

    /// Grow the task table, the trees and the value store to `capacity`.
    fn ensure_space(&self, graph: &mut Graph, capacity: usize) {
        let cap = self.tree_capacity();
        while graph.trees.len() * cap < capacity {
            graph.trees.push(SignalTree::with_capacity(cap));
        }
        while graph.slots.len() < capacity {
            graph.slots.push(TaskSlot::empty());
        }
        self.store.resize(capacity);
    }

    /// Install a task in the first non-Alive slot, growing if none exists.
    pub fn insert_task(
        &self,
        graph: &mut Graph,
        task: Task,
        error_handler: Option<ErrorHandler>,
    ) -> TaskId {
        let index = match graph.slots.iter().position(|s| !s.is_alive()) {
            Some(i) => i,
            None => {
                let i = graph.slots.len();
                self.ensure_space(graph, i + 1);
                i
            }
        };
        let slot = &graph.slots[index];
        let priority = task.priority();
        // Safety: the slot is not Alive, so no worker owns it; we hold the
        // write lock, so no other mutator exists.
        let body = unsafe { &mut *slot.body.get() };
        *body = TaskBody {
            task: Some(task),
            error_handler,
            priority,
            ..TaskBody::empty()
        };
        slot.pending.store(0, Ordering::Release);
        slot.set_state(TaskState::Alive);
        TaskId::from_raw(index)
    }

    /// Replace the error handler of an existing task.
    pub fn set_error_handler(&self, graph: &mut Graph, id: TaskId, handler: ErrorHandler) {
        if id.raw() >= graph.slots.len() || !graph.slots[id.raw()].is_alive() {
            return;
        }
        // Safety: write lock held, slot not running (pre-run mutation).
        unsafe { graph.body_mut(id) }.error_handler = Some(handler);
    }

    /// Record that `consumer` depends on `producer`.
    ///
    /// Self-loops and cycle-closing edges are rejected with `CycleFound`;
    /// dead producers and duplicate edges are ignored.
    pub fn link(
        &self,
        graph: &mut Graph,
        consumer: TaskId,
        producer: TaskId,
    ) -> Result<(), SchedulerError> {
        if consumer == producer {
            return Err(SchedulerError::CycleFound);
        }
        if producer.raw() >= graph.slots.len() || !graph.slots[producer.raw()].is_alive() {
            return Ok(());
        }
        // Safety: write lock held; no tasks running.
        if unsafe { graph.body(producer) }.out_edges.contains(&consumer) {
            return Ok(());
        }
        if self.reaches(graph, consumer, producer) {
            tracing::debug!(
                consumer = consumer.raw(),
                producer = producer.raw(),
                "edge rejected: closes a cycle"
            );
            return Err(SchedulerError::CycleFound);
        }
        // Safety: as above; the mutable borrows below are scoped and touch
        // disjoint slots (consumer != producer).
        unsafe { graph.body_mut(producer) }.out_edges.push(consumer);
        graph.slots[consumer.raw()]
            .pending
            .fetch_add(1, Ordering::AcqRel);
        unsafe { graph.body_mut(consumer) }
            .in_edges
            .push((producer, false));
        Ok(())
    }

    /// Whether a path of out-edges leads from `from` to `target` among
    /// Alive tasks.
    fn reaches(&self, graph: &Graph, from: TaskId, target: TaskId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if id.raw() >= graph.slots.len() || !graph.slots[id.raw()].is_alive() {
                continue;
            }
            // Safety: write lock held by the caller; reads only.
            let body = unsafe { graph.body(id) };
            stack.extend(body.out_edges.iter().copied());
        }
        false
    }

    /// Rebuild the ready set: zero the trees, seed the roots, and decide
    /// move-or-borrow for every edge.
    pub fn build(&self, graph: &mut Graph) -> Result<(), SchedulerError> {
        for tree in &graph.trees {
            tree.clear();
        }

        let n = graph.slots.len();
        let mut in_counts = vec![0u32; n];
        let mut out_degrees = vec![0u32; n];

        for (i, slot) in graph.slots.iter().enumerate() {
            if !slot.is_alive() {
                continue;
            }
            // Safety: write lock held, nothing running.
            let body = unsafe { &*slot.body.get() };
            for succ in &body.out_edges {
                if graph.slots[succ.raw()].is_alive() {
                    in_counts[succ.raw()] += 1;
                    out_degrees[i] += 1;
                }
            }
        }

        let mut roots = 0usize;
        for (i, slot) in graph.slots.iter().enumerate() {
            if !slot.is_alive() {
                continue;
            }
            slot.pending.store(in_counts[i], Ordering::Release);
            // Safety: as above.
            let body = unsafe { &mut *slot.body.get() };
            body.has_signaled = false;
            for edge in body.in_edges.iter_mut() {
                edge.1 = out_degrees[edge.0.raw()] == 1;
            }
            if in_counts[i] == 0 {
                let (tree, pos) = self.tree_position(TaskId::from_raw(i));
                graph.trees[tree].set(pos);
                roots += 1;
            }
        }

        if roots == 0 {
            return Err(SchedulerError::NoRootTask);
        }
        self.ready.store(roots, Ordering::Release);
        tracing::debug!(roots, tasks = n, "graph built");
        Ok(())
    }

    /// Completion hook: propagate signals, promote ready successors, wake
    /// the pool and the caller.
    pub fn on_complete(&self, graph: &Graph, id: TaskId, release_slot: bool) {
        let slot = &graph.slots[id.raw()];
        if slot.is_alive() {
            if release_slot {
                slot.set_state(TaskState::Empty);
            }
            // Safety: we are the finishing thread and sole owner.
            let body = unsafe { &mut *slot.body.get() };
            if !body.has_signaled {
                body.has_signaled = true;
                if release_slot {
                    // The callable is pinned only until completion.
                    body.task = None;
                }
                for &succ in &body.out_edges {
                    let succ_slot = &graph.slots[succ.raw()];
                    if succ_slot.pending.load(Ordering::Acquire) == 0 {
                        continue;
                    }
                    let prev = succ_slot.pending.fetch_sub(1, Ordering::AcqRel);
                    if prev == 1 && succ_slot.is_alive() {
                        self.set_signal(graph, succ);
                        self.ready.fetch_add(1, Ordering::AcqRel);
                        self.pool.waiter.notify_one();
                    }
                }
            }
        }

        self.finish_one();
        self.last_done.store(id.raw(), Ordering::Release);
    }

    /// Failure hook: the graph stops here, nothing downstream is signaled.
    pub fn on_failure(&self, id: TaskId) {
        tracing::debug!(task = id.raw(), "task failed");
        self.finish_one();
    }

    /// Reschedule hook: re-set the ready slot now that the invocation has
    /// returned, so the task can never run concurrently with itself.
    pub fn on_reschedule(&self, graph: &Graph, id: TaskId) {
        tracing::trace!(task = id.raw(), "task rescheduled");
        self.set_signal(graph, id);
        self.pool.waiter.notify_one();
    }

    fn finish_one(&self) {
        self.caller.notify_all_with(|| {
            self.ready.fetch_sub(1, Ordering::AcqRel);
        });
        self.pool.waiter.notify_one();
    }

    /// Queue fire-and-forget work on the pool, outside the DAG.
    pub fn queue_work_impl(&self, priority: Priority, job: Box<dyn FnOnce() + Send + 'static>) {
        let work = self.alloc.alloc_value(QueuedWork { job });
        self.pool.waiter.notify_one_with(|| {
            self.side_pending.fetch_add(1, Ordering::AcqRel);
        });
        self.side_work.push(work.as_ptr() as usize, priority);
    }

    /// Pop and run one side-work item. Returns false when no work was found.
    pub fn run_side_work(&self) -> bool {
        let Some(addr) = self.side_work.pop() else {
            return false;
        };
        // Safety: the address was produced by `queue_work_impl` and the
        // lanes hand each item to exactly one worker.
        let work = unsafe {
            self.alloc
                .take_value(NonNull::new_unchecked(addr as *mut QueuedWork))
        };
        (work.job)();
        self.metrics.record_side_work();
        self.caller.notify_all_with(|| {
            self.side_pending.fetch_sub(1, Ordering::AcqRel);
        });
        true
    }

    /// Drop queued side work without running it (reset/drop path).
    pub fn drain_side_work(&self) {
        while let Some(addr) = self.side_work.pop() {
            // Safety: as in `run_side_work`.
            unsafe {
                self.alloc
                    .drop_value(NonNull::new_unchecked(addr as *mut QueuedWork));
            }
            self.caller.notify_all_with(|| {
                self.side_pending.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
