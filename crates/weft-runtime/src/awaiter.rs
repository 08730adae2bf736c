//! One-shot awaitable for side work.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

struct Shared<T> {
    slot: Mutex<Option<thread::Result<T>>>,
    cv: Condvar,
}

/// Handle to a queued side-work item's eventual result.
///
/// [`Awaiter::wait`] blocks the calling thread until the work finishes and
/// yields `Ok(value)`, or `Err(payload)` if the work panicked, the same
/// shape as [`std::thread::JoinHandle::join`]. Waiting from inside a task
/// blocks that task's worker thread for the duration.
pub struct Awaiter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Awaiter<T> {
    pub(crate) fn new() -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        });
        (
            Self {
                shared: shared.clone(),
            },
            Completer { shared },
        )
    }

    /// Whether the result has already arrived.
    pub fn is_finished(&self) -> bool {
        self.shared.slot.lock().is_some()
    }

    /// Block until the side work finishes and take its result.
    pub fn wait(self) -> thread::Result<T> {
        let mut slot = self.shared.slot.lock();
        while slot.is_none() {
            self.shared.cv.wait(&mut slot);
        }
        slot.take().expect("awaiter completed twice")
    }
}

/// Producer side of an [`Awaiter`], held by the queued work item.
pub(crate) struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: thread::Result<T>) {
        let mut slot = self.shared.slot.lock();
        *slot = Some(result);
        self.shared.cv.notify_all();
    }
}
