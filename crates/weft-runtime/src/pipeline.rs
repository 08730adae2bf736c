//! Stage-oriented graph builder.
//!
//! A thin layer over `add_task`/`depends_on` for the common
//! chain / fan-out / fan-in shapes. Each combinator opens a new stage whose
//! tasks depend on every task of the previous stage; values still flow
//! through the value store, so stage tasks read their inputs with
//! [`TaskToken::args`](crate::token::TaskToken::args) or
//! [`TaskToken::all_of`](crate::token::TaskToken::all_of) as usual. The
//! builder is cosmetic; the underlying graph is the contract.
//!
//! ```
//! use weft_runtime::{pipeline, Scheduler, Task, TaskToken, Priority};
//!
//! let s = Scheduler::new();
//! let sink = pipeline(&s)
//!     .then(|_: &mut TaskToken| 10i64)
//!     .fan_out([
//!         Task::new(|t: &mut TaskToken| t.args::<(i64,)>().0.unwrap().take() + 1, Priority::Normal),
//!         Task::new(|t: &mut TaskToken| t.args::<(i64,)>().0.unwrap().take() * 2, Priority::Normal),
//!     ])
//!     .sink(|t: &mut TaskToken| t.all_of::<i64>().into_iter().map(|v| v.take()).sum::<i64>())
//!     .unwrap();
//! s.run().unwrap();
//! assert_eq!(s.get_result::<i64>(sink).unwrap(), 11 + 20);
//! ```

use std::any::Any;

use weft_core::error::SchedulerError;

use crate::scheduler::{DependencyTracker, Scheduler};
use crate::task::{Priority, Task};
use crate::token::TaskToken;

/// Start a pipeline on the scheduler.
pub fn pipeline(scheduler: &Scheduler) -> Pipeline<'_> {
    Pipeline {
        scheduler,
        stage: Vec::new(),
        error: None,
    }
}

/// An in-progress pipeline; the current stage is the set of tasks the next
/// combinator will depend on.
pub struct Pipeline<'s> {
    scheduler: &'s Scheduler,
    stage: Vec<DependencyTracker<'s>>,
    error: Option<SchedulerError>,
}

impl<'s> Pipeline<'s> {
    /// Append one task depending on the whole current stage.
    pub fn then<F, R>(self, f: F) -> Self
    where
        F: FnMut(&mut TaskToken<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.then_task(Task::new(f, Priority::Normal))
    }

    /// Append one prepared task depending on the whole current stage.
    pub fn then_task(mut self, task: Task) -> Self {
        let tracker = self.scheduler.add_prepared(task);
        self.wire(&tracker);
        self.stage = vec![tracker];
        self
    }

    /// Open a parallel stage: every task depends on the whole previous
    /// stage, and the next combinator will depend on all of them.
    pub fn fan_out(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut next = Vec::new();
        for task in tasks {
            let tracker = self.scheduler.add_prepared(task);
            self.wire(&tracker);
            next.push(tracker);
        }
        self.stage = next;
        self
    }

    /// Attach a failure handler to every task of the current stage.
    pub fn with_error<H>(self, handler: H) -> Self
    where
        H: FnMut(&(dyn Any + Send)) -> bool + Send + Clone + 'static,
    {
        for tracker in &self.stage {
            tracker.set_error_handler(handler.clone());
        }
        self
    }

    /// Close the pipeline with a final fan-in task and return its tracker.
    pub fn sink<F, R>(self, f: F) -> Result<DependencyTracker<'s>, SchedulerError>
    where
        F: FnMut(&mut TaskToken<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let built = self.then(f);
        let mut stage = built.finish()?;
        Ok(stage.pop().expect("sink stage is never empty"))
    }

    /// Return the current stage's trackers, surfacing any wiring error.
    pub fn finish(self) -> Result<Vec<DependencyTracker<'s>>, SchedulerError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.stage),
        }
    }

    fn wire(&mut self, tracker: &DependencyTracker<'s>) {
        if self.stage.is_empty() {
            return;
        }
        if let Err(e) = tracker.depends_on(&self.stage) {
            self.error.get_or_insert(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::SchedulerConfig;

    fn scheduler() -> Scheduler {
        Scheduler::with_config(SchedulerConfig::new().with_workers(4))
    }

    #[test]
    fn test_chain() {
        let s = scheduler();
        let sink = pipeline(&s)
            .then(|_: &mut TaskToken| 1i64)
            .then(|t: &mut TaskToken| t.args::<(i64,)>().0.unwrap().take() + 1)
            .sink(|t: &mut TaskToken| t.args::<(i64,)>().0.unwrap().take() + 1)
            .unwrap();
        s.run().unwrap();
        assert_eq!(s.get_result::<i64>(sink).unwrap(), 3);
    }

    #[test]
    fn test_fan_out_fan_in() {
        let s = scheduler();
        let sink = pipeline(&s)
            .then(|_: &mut TaskToken| 5i64)
            .fan_out((0..4).map(|k| {
                Task::new(
                    move |t: &mut TaskToken| t.args::<(i64,)>().0.unwrap().take() + k,
                    Priority::Normal,
                )
            }))
            .sink(|t: &mut TaskToken| {
                t.all_of::<i64>().into_iter().map(|v| v.take()).sum::<i64>()
            })
            .unwrap();
        s.run().unwrap();
        // 5+0, 5+1, 5+2, 5+3
        assert_eq!(s.get_result::<i64>(sink).unwrap(), 26);
    }

    #[test]
    fn test_with_error_keeps_pipeline_draining() {
        let s = scheduler();
        let stage = pipeline(&s)
            .then(|_: &mut TaskToken| -> i64 { panic!("stage failed") })
            .with_error(|_| true)
            .sink(|t: &mut TaskToken| {
                // The failed stage left no value behind.
                i64::from(t.args::<(i64,)>().0.is_err())
            })
            .unwrap();
        s.run().unwrap();
        assert_eq!(s.get_result::<i64>(stage).unwrap(), 1);
    }

    #[test]
    fn test_empty_pipeline_finish() {
        let s = scheduler();
        let stage = pipeline(&s).finish().unwrap();
        assert!(stage.is_empty());
    }
}
