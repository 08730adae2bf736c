//! Blocking channels over the lock-free queues.
//!
//! [`Channel`] wraps any queue backend with close semantics and waiter-based
//! blocking. [`BoundedChannel`] rides the fixed-capacity ring (senders block
//! when full); [`UnboundedChannel`] rides the segmented queue (sends never
//! block). Items are machine-word-sized; anything larger travels as
//! `Box<T>`.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use weft_core::error::ChannelError;
use weft_core::sync::{RingBuffer, SegQueue, Waiter, Word};

/// Queue backend pluggable into a [`Channel`].
pub trait ChannelQueue<T: Word> {
    /// Non-blocking push; hands the item back when there is no room.
    fn try_push(&self, value: T) -> Result<(), T>;
    fn try_pop(&self) -> Option<T>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn is_full(&self) -> bool;
}

impl<T: Word> ChannelQueue<T> for RingBuffer<T> {
    fn try_push(&self, value: T) -> Result<(), T> {
        self.push(value)
    }
    fn try_pop(&self) -> Option<T> {
        self.pop()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
    fn is_full(&self) -> bool {
        self.is_full()
    }
}

impl<T: Word> ChannelQueue<T> for SegQueue<T> {
    fn try_push(&self, value: T) -> Result<(), T> {
        self.push(value);
        Ok(())
    }
    fn try_pop(&self) -> Option<T> {
        self.pop()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
    fn is_full(&self) -> bool {
        false
    }
}

/// MPMC channel with close semantics.
pub struct Channel<T: Word, Q: ChannelQueue<T>> {
    queue: Q,
    closed: AtomicBool,
    waiter: Waiter,
    _items: PhantomData<fn(T) -> T>,
}

/// Channel over the bounded ring; `send` blocks while full.
pub type BoundedChannel<T> = Channel<T, RingBuffer<T>>;

/// Channel over the unbounded segmented queue; `send` never blocks.
pub type UnboundedChannel<T> = Channel<T, SegQueue<T>>;

impl<T: Word> BoundedChannel<T> {
    /// A bounded channel holding up to `capacity` items (power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        Self::over(RingBuffer::with_capacity(capacity))
    }
}

impl<T: Word> UnboundedChannel<T> {
    pub fn new() -> Self {
        Self::over(SegQueue::new())
    }
}

impl<T: Word> Default for UnboundedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Word, Q: ChannelQueue<T>> Channel<T, Q> {
    /// Wrap an existing queue backend.
    pub fn over(queue: Q) -> Self {
        Self {
            queue,
            closed: AtomicBool::new(false),
            waiter: Waiter::new(),
            _items: PhantomData,
        }
    }

    /// Send an item, blocking while the queue is full.
    ///
    /// Fails with [`ChannelError::Closed`] once the channel closes, including
    /// for senders that were already blocked when the close happened.
    pub fn send(&self, value: T) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut item = value;
        loop {
            match self.queue.try_push(item) {
                Ok(()) => {
                    self.waiter.notify_all();
                    return Ok(());
                }
                Err(v) => item = v,
            }
            self.waiter
                .wait(|| !self.queue.is_full() || self.closed.load(Ordering::Acquire));
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
        }
    }

    /// Non-blocking send. `Ok(None)` means sent; `Ok(Some(value))` hands the
    /// item back because the queue is full.
    pub fn try_send(&self, value: T) -> Result<Option<T>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        match self.queue.try_push(value) {
            Ok(()) => {
                self.waiter.notify_all();
                Ok(None)
            }
            Err(v) => Ok(Some(v)),
        }
    }

    /// Receive an item, blocking while the channel is empty.
    ///
    /// Returns `None` once the channel is closed *and* drained.
    pub fn receive(&self) -> Option<T> {
        loop {
            if let Some(v) = self.queue.try_pop() {
                self.waiter.notify_all();
                return Some(v);
            }
            if self.closed.load(Ordering::Acquire) && self.queue.is_empty() {
                return None;
            }
            self.waiter
                .wait(|| !self.queue.is_empty() || self.closed.load(Ordering::Acquire));
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Option<T> {
        let v = self.queue.try_pop();
        if v.is_some() {
            self.waiter.notify_all();
        }
        v
    }

    /// Close the channel and wake everyone blocked on it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waiter.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
