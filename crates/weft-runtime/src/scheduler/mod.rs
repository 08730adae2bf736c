//! The scheduler: DAG ownership, build, dispatch and results.
//!
//! A [`Scheduler`] owns the task table, the signal trees, the value store
//! and the worker pool. The lifecycle is: `add_task` / `depends_on` to shape
//! the graph, `run` to execute it to quiescence, `get_result` to collect
//! outputs, and `reset` to start over. Dropping the scheduler joins the
//! pool.

pub(crate) mod side_work;
pub(crate) mod state;
pub mod worker;

use std::any::Any;
use std::panic;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use weft_core::error::{SchedulerError, ValueStoreError};
use weft_core::{SchedulerConfig, TaskId};

use crate::awaiter::Awaiter;
use crate::task::{ErrorHandler, Priority, Task};
use crate::token::TaskToken;
use self::state::SchedulerState;
use self::worker::WorkerPool;

/// Task-parallel scheduler over a fixed worker pool.
pub struct Scheduler {
    state: Arc<SchedulerState>,
    // Drop joins the pool before the shared state can go away.
    pool: WorkerPool,
}

impl Scheduler {
    /// A scheduler with default configuration (one worker per logical CPU).
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// A scheduler with explicit configuration. Out-of-range fields are
    /// clamped; see [`SchedulerConfig::normalized`].
    pub fn with_config(config: SchedulerConfig) -> Self {
        let cfg = config.normalized();
        let workers = cfg.workers;
        let state = Arc::new(SchedulerState::new(cfg));
        let pool = WorkerPool::spawn(&state, workers);
        Self { state, pool }
    }

    /// The configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.state.cfg
    }

    /// Add a task with normal priority.
    ///
    /// The closure's non-unit return value becomes the task's output.
    pub fn add_task<F, R>(&self, f: F) -> DependencyTracker<'_>
    where
        F: FnMut(&mut TaskToken<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.insert(Task::new(f, Priority::Normal), None)
    }

    /// Add a task with an explicit priority.
    pub fn add_task_with_priority<F, R>(&self, f: F, priority: Priority) -> DependencyTracker<'_>
    where
        F: FnMut(&mut TaskToken<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.insert(Task::new(f, priority), None)
    }

    /// Add a task with a failure handler.
    ///
    /// The handler runs if the task panics; returning `true` keeps the graph
    /// draining (the task completes as failed), returning `false` stops
    /// propagation at this task.
    pub fn add_task_with_handler<F, R, H>(
        &self,
        f: F,
        handler: H,
        priority: Priority,
    ) -> DependencyTracker<'_>
    where
        F: FnMut(&mut TaskToken<'_>) -> R + Send + 'static,
        R: Send + 'static,
        H: FnMut(&(dyn Any + Send)) -> bool + Send + 'static,
    {
        self.insert(Task::new(f, priority), Some(ErrorHandler::new(handler)))
    }

    /// Add an already-constructed [`Task`]. This is what the pipeline
    /// builder uses to mix differently-typed closures in one stage.
    pub fn add_prepared(&self, task: Task) -> DependencyTracker<'_> {
        self.insert(task, None)
    }

    fn insert(&self, task: Task, handler: Option<ErrorHandler>) -> DependencyTracker<'_> {
        let mut graph = self.state.graph.write();
        let id = self.state.insert_task(&mut graph, task, handler);
        DependencyTracker {
            id,
            scheduler: self,
        }
    }

    /// Execute the graph to quiescence.
    ///
    /// Blocks until every reachable task has completed, failed or been
    /// drained, and all side work has finished. If a task panicked without
    /// a handler, the first captured panic is re-raised here.
    pub fn run(&self) -> Result<(), SchedulerError> {
        self.state.last_done.store(usize::MAX, Ordering::Release);
        {
            let mut graph = self.state.graph.write();
            self.state.build(&mut graph)?;
        }

        self.state.running.store(true, Ordering::Release);
        self.state.pool.waiter.notify_all();

        self.state.caller.wait(|| {
            self.state.ready.load(Ordering::Acquire) == 0
                && self.state.pool.is_running()
                && self.state.side_pending.load(Ordering::Acquire) == 0
        });
        self.state.running.store(false, Ordering::Release);

        // Re-raise the first unhandled task panic at the join point.
        let captured = {
            let graph = self.state.graph.read();
            let mut found = None;
            for slot in graph.slots.iter() {
                // Safety: nothing is running; the caller owns the table.
                let body = unsafe { &mut *slot.body.get() };
                if let Some(payload) = body.panic.take() {
                    found = Some(payload);
                    break;
                }
            }
            found
        };
        if let Some(payload) = captured {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    /// Consume the output of `task`. Only answers while not running;
    /// during a run it reports `NotFound`.
    pub fn get_result<T: Send + 'static>(
        &self,
        task: impl Into<TaskId>,
    ) -> Result<T, ValueStoreError> {
        if self.state.is_running() {
            return Err(ValueStoreError::NotFound);
        }
        self.state.store.consume::<T>(task.into())
    }

    /// Consume the output of the most recently completed task.
    pub fn get_last_result<T: Send + 'static>(&self) -> Result<T, ValueStoreError> {
        let raw = self.state.last_done.load(Ordering::Acquire);
        if raw == usize::MAX {
            return Err(ValueStoreError::NotFound);
        }
        self.get_result(TaskId::from_raw(raw))
    }

    /// Queue fire-and-forget side work. Side work runs on the pool while
    /// the scheduler is running.
    pub fn queue_work<F>(&self, f: F, priority: Priority)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.queue_work_impl(priority, Box::new(f));
    }

    /// Queue side work and get an awaitable for its result.
    pub fn awaitable_queue_work<F, R>(&self, f: F, priority: Priority) -> Awaiter<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (awaiter, completer) = Awaiter::new();
        self.state.queue_work_impl(
            priority,
            Box::new(move || {
                let result = panic::catch_unwind(panic::AssertUnwindSafe(f));
                completer.complete(result);
            }),
        );
        awaiter
    }

    /// Clear the task table, the ready set and the value store. The worker
    /// pool stays alive. With `reuse_arena` the value arena keeps its
    /// blocks; without it they are freed.
    pub fn reset(&self, reuse_arena: bool) {
        let mut graph = self.state.graph.write();
        self.state.drain_side_work();
        debug_assert!(self.state.side_work.is_empty());
        graph.slots.clear();
        graph.trees.clear();
        self.state.store.clear(reuse_arena);
        self.state.ready.store(0, Ordering::Release);
        self.state.last_done.store(usize::MAX, Ordering::Release);
    }

    /// The scheduler's metrics counters.
    pub fn metrics(&self) -> &crate::observability::MetricsCollector {
        &self.state.metrics
    }

    /// Whether no task slot is currently ready.
    pub fn is_idle(&self) -> bool {
        let graph = self.state.graph.read();
        graph.trees.iter().all(|t| t.is_empty())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.pool.stop();
        self.state.drain_side_work();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.state.cfg.workers)
            .field("running", &self.state.is_running())
            .finish()
    }
}

/// Handle to one added task, used to wire dependencies.
#[derive(Clone, Copy)]
pub struct DependencyTracker<'s> {
    id: TaskId,
    scheduler: &'s Scheduler,
}

impl DependencyTracker<'_> {
    /// The task's id.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Declare that this task consumes the outputs of `producers`.
    ///
    /// Self-dependencies and edges that would close a cycle fail with
    /// [`SchedulerError::CycleFound`] and are not recorded; producers that
    /// are not alive are skipped.
    pub fn depends_on(&self, producers: &[DependencyTracker<'_>]) -> Result<(), SchedulerError> {
        let state = &self.scheduler.state;
        let mut graph = state.graph.write();
        for producer in producers {
            state.link(&mut graph, self.id, producer.id)?;
        }
        Ok(())
    }

    /// Attach or replace the task's failure handler.
    pub fn set_error_handler<H>(&self, handler: H)
    where
        H: FnMut(&(dyn Any + Send)) -> bool + Send + 'static,
    {
        let state = &self.scheduler.state;
        let mut graph = state.graph.write();
        state.set_error_handler(&mut graph, self.id, ErrorHandler::new(handler));
    }
}

impl From<DependencyTracker<'_>> for TaskId {
    fn from(t: DependencyTracker<'_>) -> TaskId {
        t.id
    }
}

impl std::fmt::Debug for DependencyTracker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DependencyTracker({:?})", self.id)
    }
}
