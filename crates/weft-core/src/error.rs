//! Error taxonomy of the scheduler and its collaborators.
//!
//! Graph errors ([`SchedulerError`]) are local to the API call that produced
//! them and recoverable: the caller can adjust the graph and retry. Value
//! access errors surface from the store and from [`TaskError`]-returning
//! token reads. Channel errors only report closure.

use thiserror::Error;

/// Errors produced while building or running a task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Every alive task depends on another alive task, so nothing can start.
    #[error("graph has no root task: every task depends on another task")]
    NoRootTask,

    /// Adding the requested edge would close a directed cycle.
    #[error("dependency cycle detected")]
    CycleFound,
}

/// Errors produced by typed access to the value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValueStoreError {
    /// A value exists at the id, but not of the requested type.
    #[error("stored value has a different type than requested")]
    TypeMismatch,

    /// No value is stored at the id.
    #[error("no value stored for the task")]
    NotFound,
}

/// Errors surfaced to a task reading its inputs through the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The producer's value has a different type than requested.
    #[error("input value has a different type than requested")]
    TypeMismatch,

    /// The producer finished without leaving a value.
    #[error("input value not found")]
    NotFound,

    /// The id names no input of this task.
    #[error("task id is not an input of this task")]
    InvalidTaskId,

    /// A positional type request could not be matched to any input.
    #[error("no unclaimed input matches the requested type")]
    ArityMismatch,
}

impl From<ValueStoreError> for TaskError {
    fn from(e: ValueStoreError) -> Self {
        match e {
            ValueStoreError::TypeMismatch => TaskError::TypeMismatch,
            ValueStoreError::NotFound => TaskError::NotFound,
        }
    }
}

/// Errors produced by channel endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel has been closed; no further sends are accepted.
    #[error("channel is closed")]
    Closed,
}
