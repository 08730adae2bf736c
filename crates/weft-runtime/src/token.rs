//! Per-invocation task handle.
//!
//! A [`TaskToken`] is constructed once per task invocation and is the task's
//! only window into the engine: reading inputs, staging the output, asking
//! to run again or to stop, and submitting side work.
//!
//! Input transfer follows the move-or-clone decision made at build time: a
//! producer with exactly one consumer hands its value over by move
//! ([`CowCell::Owned`]); a producer feeding several consumers lends a borrow
//! ([`CowCell::Borrowed`]).

use std::any::TypeId;
use std::panic::{self, AssertUnwindSafe};

use weft_core::cow::CowCell;
use weft_core::error::TaskError;
use weft_core::TaskId;

use crate::awaiter::Awaiter;
use crate::scheduler::state::{Graph, SchedulerState, TaskState};
use crate::task::{Priority, TaskResult};

/// Handle given to a task for the duration of one invocation.
pub struct TaskToken<'run> {
    state: &'run SchedulerState,
    graph: &'run Graph,
    id: TaskId,
    inputs: Vec<(TaskId, bool)>,
    result: TaskResult,
    priority: Priority,
}

impl<'run> TaskToken<'run> {
    pub(crate) fn new(
        state: &'run SchedulerState,
        graph: &'run Graph,
        id: TaskId,
        inputs: Vec<(TaskId, bool)>,
        priority: Priority,
    ) -> Self {
        Self {
            state,
            graph,
            id,
            inputs,
            result: TaskResult::Success,
            priority,
        }
    }

    /// The id of the task this token belongs to.
    #[inline]
    pub fn owner_id(&self) -> TaskId {
        self.id
    }

    /// The priority this task was added with.
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The invocation result as it stands.
    #[inline]
    pub fn result(&self) -> TaskResult {
        self.result
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.result == TaskResult::Success
    }

    /// Read the input produced by `producer`.
    ///
    /// Moves the value out when this task is the producer's only consumer,
    /// borrows it otherwise. Fails with `InvalidTaskId` if `producer` is not
    /// an input of this task.
    pub fn arg<T: Send + 'static>(&self, producer: TaskId) -> Result<CowCell<'_, T>, TaskError> {
        let Some(&(_, consumable)) = self.inputs.iter().find(|(p, _)| *p == producer) else {
            return Err(TaskError::InvalidTaskId);
        };
        if consumable {
            let value = self.state.store.consume::<T>(producer)?;
            Ok(CowCell::Owned(value))
        } else {
            let value = self.state.store.get::<T>(producer)?;
            Ok(CowCell::Borrowed(value))
        }
    }

    /// Read inputs positionally by type.
    ///
    /// For each requested type, the first input whose stored value has that
    /// type and has not been claimed earlier in the same call is selected;
    /// a type with no matching input yields `ArityMismatch`.
    ///
    /// ```ignore
    /// let (a, b) = token.args::<(i64, String)>();
    /// ```
    pub fn args<'a, A: ArgTuple<'a>>(&'a self) -> A::Output {
        A::fetch(self)
    }

    /// Every input whose stored value has type `T`, in in-edge order.
    pub fn all_of<T: Send + 'static>(&self) -> Vec<CowCell<'_, T>> {
        let want = TypeId::of::<T>();
        self.inputs
            .iter()
            .filter(|(p, _)| self.state.store.get_type(*p) == Some(want))
            .filter_map(|&(p, _)| self.arg::<T>(p).ok())
            .collect()
    }

    /// Stage the task's return value.
    ///
    /// Ignored (returning false) once the task has failed.
    pub fn output<T: Send + 'static>(&mut self, value: T) -> bool {
        if self.result == TaskResult::Failed {
            return false;
        }
        self.state.store.put(self.id, value);
        self.state.metrics.record_publish();
        true
    }

    /// Ask to run again. The ready slot is re-set by the scheduler after
    /// this invocation returns, and the invocation produces no output.
    pub fn schedule(&mut self) {
        if !self.id.is_valid() {
            return;
        }
        if self.graph.slots[self.id.raw()].state() != TaskState::Alive {
            return;
        }
        self.result = TaskResult::Rescheduled;
    }

    /// Abort this task. The slot is marked dead immediately and released by
    /// the scheduler after this invocation returns.
    pub fn stop(&mut self) {
        if !self.id.is_valid() {
            return;
        }
        self.state.store.remove(self.id);
        self.graph.slots[self.id.raw()].set_state(TaskState::Dead);
        self.result = TaskResult::Failed;
    }

    /// Queue fire-and-forget work on the pool, outside the DAG.
    pub fn queue_work<F>(&self, f: F, priority: Priority)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.queue_work_impl(priority, Box::new(f));
    }

    /// Queue side work and get an awaitable for its result.
    ///
    /// Waiting on the awaiter from inside a task blocks this task's worker
    /// thread until the side work finishes.
    pub fn awaitable_queue_work<F, R>(&self, f: F, priority: Priority) -> Awaiter<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (awaiter, completer) = Awaiter::new();
        self.state.queue_work_impl(
            priority,
            Box::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(f));
                completer.complete(result);
            }),
        );
        awaiter
    }

    pub(crate) fn inputs(&self) -> &[(TaskId, bool)] {
        &self.inputs
    }

    pub(crate) fn stored_type(&self, id: TaskId) -> Option<TypeId> {
        self.state.store.get_type(id)
    }
}

/// Tuples of types fetchable positionally through [`TaskToken::args`].
pub trait ArgTuple<'a>: Sized {
    type Output;
    fn fetch(token: &'a TaskToken<'a>) -> Self::Output;
}

macro_rules! impl_arg_tuple {
    ($n:expr; $($ty:ident),+) => {
        impl<'a, $($ty: Send + 'static),+> ArgTuple<'a> for ($($ty,)+) {
            type Output = ($(Result<CowCell<'a, $ty>, TaskError>,)+);

            fn fetch(token: &'a TaskToken<'a>) -> Self::Output {
                let requested = [$(TypeId::of::<$ty>()),+];
                let mut assigned = [TaskId::INVALID; $n];

                // First unclaimed producer whose stored type matches, in
                // in-edge order; each producer feeds at most one position.
                for &(producer, _) in token.inputs() {
                    let Some(tag) = token.stored_type(producer) else {
                        continue;
                    };
                    for k in 0..$n {
                        if assigned[k] == TaskId::INVALID && requested[k] == tag {
                            assigned[k] = producer;
                            break;
                        }
                    }
                }

                let mut position = 0usize;
                ($(
                    {
                        let id = assigned[position];
                        position += 1;
                        let _ = position;
                        if id == TaskId::INVALID {
                            Err::<CowCell<'a, $ty>, TaskError>(TaskError::ArityMismatch)
                        } else {
                            token.arg::<$ty>(id)
                        }
                    },
                )+)
            }
        }
    };
}

impl_arg_tuple!(1; T1);
impl_arg_tuple!(2; T1, T2);
impl_arg_tuple!(3; T1, T2, T3);
impl_arg_tuple!(4; T1, T2, T3, T4);
impl_arg_tuple!(5; T1, T2, T3, T4, T5);
impl_arg_tuple!(6; T1, T2, T3, T4, T5, T6);
impl_arg_tuple!(7; T1, T2, T3, T4, T5, T6, T7);
impl_arg_tuple!(8; T1, T2, T3, T4, T5, T6, T7, T8);
