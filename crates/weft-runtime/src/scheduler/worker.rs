//! The worker pool and the per-task dispatch path.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use weft_core::sync::Waiter;
use weft_core::TaskId;

use crate::scheduler::state::{Graph, SchedulerState, TaskState};
use crate::task::TaskResult;
use crate::token::TaskToken;

thread_local! {
    static POOL_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Introspection for code running on pool threads.
pub mod this_thread {
    use super::POOL_ID;

    /// The zero-based pool id of the current worker thread, or `None` when
    /// called from outside a worker pool.
    pub fn pool_id() -> Option<usize> {
        let id = POOL_ID.get();
        (id != usize::MAX).then_some(id)
    }
}

/// Coordination point between the pool threads and the scheduler.
pub(crate) struct PoolShared {
    pub waiter: Waiter,
    pub running: AtomicBool,
}

impl PoolShared {
    pub fn new() -> Self {
        Self {
            waiter: Waiter::new(),
            running: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A fixed set of OS threads that drain the scheduler.
pub(crate) struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn spawn(state: &Arc<SchedulerState>, workers: usize) -> Self {
        let shared = state.pool.clone();
        let threads = (0..workers)
            .map(|worker_id| {
                let state = Arc::clone(state);
                std::thread::Builder::new()
                    .name(format!("weft-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, &state))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { threads, shared }
    }

    /// Stop and join every worker. Idempotent.
    pub fn stop(&mut self) {
        self.shared.waiter.notify_all_with(|| {
            self.shared.running.store(false, Ordering::Release);
        });
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Main worker loop: sleep until the scheduler has work, then alternate
/// between claimed DAG tasks and side work until stopped.
fn worker_loop(worker_id: usize, state: &Arc<SchedulerState>) {
    POOL_ID.set(worker_id);
    tracing::trace!(worker_id, "worker started");
    let pool = state.pool.clone();

    loop {
        pool.waiter.wait(|| {
            !pool.is_running()
                || (state.is_running()
                    && (state.ready.load(Ordering::Acquire) > 0
                        || state.side_pending.load(Ordering::Acquire) > 0))
        });
        if !pool.is_running() {
            break;
        }

        let graph = state.graph.read();
        match state.pop_ready(&graph) {
            Some(id) => run_task(state, &graph, id),
            None => {
                drop(graph);
                state.run_side_work();
            }
        }
    }

    POOL_ID.set(usize::MAX);
    tracing::trace!(worker_id, "worker stopped");
}

enum Outcome {
    Finished(TaskResult),
    /// Panicked; the handler voted to keep the graph draining.
    Demoted,
    /// Panicked with no handler (payload stored) or handler voted to stop.
    Failed,
}

/// Run one claimed task through a fresh token and dispatch its outcome.
fn run_task(state: &Arc<SchedulerState>, graph: &Graph, id: TaskId) {
    let slot = &graph.slots[id.raw()];
    debug_assert_eq!(slot.state(), TaskState::Alive);
    state.metrics.record_dispatch();

    let outcome = {
        // Safety: this worker claimed the slot from a signal tree, making
        // it the sole owner for the duration of the invocation.
        let body = unsafe { graph.body_mut(id) };
        let mut token = TaskToken::new(state, graph, id, body.in_edges.clone(), body.priority);

        let call = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(task) = body.task.as_mut() {
                (task.run)(&mut token);
            }
        }));

        match call {
            Ok(()) => Outcome::Finished(token.result()),
            Err(payload) => match body.error_handler.as_mut() {
                Some(handler) => {
                    if handler.invoke(payload.as_ref()) {
                        Outcome::Demoted
                    } else {
                        Outcome::Failed
                    }
                }
                None => {
                    tracing::debug!(
                        task = id.raw(),
                        message = crate::task::panic_message(payload.as_ref()),
                        "task panicked; deferring to run()"
                    );
                    body.panic = Some(payload);
                    Outcome::Failed
                }
            },
        }
    };

    match outcome {
        Outcome::Finished(TaskResult::Success) => {
            state.metrics.record_completion();
            state.on_complete(graph, id, true);
        }
        Outcome::Finished(TaskResult::Failed) | Outcome::Failed => {
            state.metrics.record_failure();
            if slot.state() == TaskState::Dead {
                // The task stopped itself; the invocation is over, so the
                // slot can be reused.
                slot.set_state(TaskState::Empty);
            }
            state.on_failure(id);
        }
        Outcome::Finished(TaskResult::Rescheduled) => {
            state.metrics.record_reschedule();
            state.on_reschedule(graph, id);
        }
        Outcome::Demoted => {
            // Output is discarded, but the edges still complete.
            state.metrics.record_failure();
            state.store.remove(id);
            state.on_complete(graph, id, true);
        }
    }
}
