//! Mutex + condvar shell for predicate waits.
//!
//! The waiter carries no data of its own; predicates read state that lives
//! elsewhere (usually atomics). To keep such waits race-free, every notifier
//! that mutates predicate state does so *inside* the waiter's lock through
//! [`Waiter::notify_all_with`] / [`Waiter::notify_one_with`]; a waiter that
//! observed a false predicate is then guaranteed to be parked (or past the
//! mutation) before the notification fires.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A reusable condition-variable wait point.
#[derive(Debug, Default)]
pub struct Waiter {
    mutex: Mutex<()>,
    cv: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `cond` returns true.
    pub fn wait(&self, mut cond: impl FnMut() -> bool) {
        let mut guard = self.mutex.lock();
        while !cond() {
            self.cv.wait(&mut guard);
        }
    }

    /// Block until `cond` returns true or `timeout` elapses. Returns the
    /// final value of the predicate.
    pub fn wait_for(&self, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let mut guard = self.mutex.lock();
        while !cond() {
            if self.cv.wait_for(&mut guard, timeout).timed_out() {
                return cond();
            }
        }
        true
    }

    /// Wake all waiters.
    pub fn notify_all(&self) {
        let _guard = self.mutex.lock();
        self.cv.notify_all();
    }

    /// Run `f` under the waiter's lock, then wake all waiters.
    pub fn notify_all_with(&self, f: impl FnOnce()) {
        let _guard = self.mutex.lock();
        f();
        self.cv.notify_all();
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        let _guard = self.mutex.lock();
        self.cv.notify_one();
    }

    /// Run `f` under the waiter's lock, then wake one waiter.
    pub fn notify_one_with(&self, f: impl FnOnce()) {
        let _guard = self.mutex.lock();
        f();
        self.cv.notify_one();
    }
}
