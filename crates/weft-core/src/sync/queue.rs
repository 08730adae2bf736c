//! Unbounded MPMC queue: a linked list of bounded ring segments.
//!
//! Producers push into the head segment and CAS-link a fresh segment when it
//! fills; consumers pop from the tail segment and CAS-advance past drained
//! ones. Segments are single-use: a per-segment ticket counter admits exactly
//! `capacity` pushes over the segment's lifetime, so a segment that has been
//! fully consumed can never receive another item. That is what makes
//! detaching sound: once `popped == capacity` the segment is inert, and any
//! straggling reader is covered by the queue's [`HazardDomain`]: detached
//! segments are retired, not freed, until no protection slot references them.

use crossbeam_utils::{Backoff, CachePadded};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::sync::hazard::HazardDomain;
use crate::sync::ring::{RingBuffer, Word};

/// Default ring capacity of one segment.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 128;

struct Segment<T: Word> {
    ring: RingBuffer<T>,
    /// Push tickets claimed on this segment. Once it reaches the ring
    /// capacity the segment stops admitting items forever.
    tickets: AtomicU64,
    /// Items consumed out of this segment. `popped == capacity` marks the
    /// segment exhausted and safe to detach.
    popped: AtomicU64,
    next: AtomicPtr<Segment<T>>,
}

impl<T: Word> Segment<T> {
    fn boxed(capacity: usize) -> *mut Self {
        Box::into_raw(Box::new(Segment {
            ring: RingBuffer::with_capacity(capacity),
            tickets: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Unbounded lock-free MPMC queue of machine-word-sized items.
pub struct SegQueue<T: Word> {
    head: CachePadded<AtomicPtr<Segment<T>>>,
    tail: CachePadded<AtomicPtr<Segment<T>>>,
    pushed_total: CachePadded<AtomicU64>,
    popped_total: CachePadded<AtomicU64>,
    domain: HazardDomain,
    segment_capacity: usize,
}

// Safety: segments are shared through atomics with hazard-pointer protected
// reclamation; items transfer by value through the rings.
unsafe impl<T: Word + Send> Send for SegQueue<T> {}
unsafe impl<T: Word + Send> Sync for SegQueue<T> {}

impl<T: Word> SegQueue<T> {
    pub fn new() -> Self {
        Self::with_segment_capacity(DEFAULT_SEGMENT_CAPACITY)
    }

    /// A queue whose segments hold `capacity` items each (power of two).
    pub fn with_segment_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_threshold(capacity, crate::sync::hazard::DEFAULT_RETIRE_THRESHOLD)
    }

    /// A queue with a custom hazard retirement threshold, for callers that
    /// want tighter garbage bounds.
    pub fn with_capacity_and_threshold(capacity: usize, retire_threshold: usize) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            tail: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            pushed_total: CachePadded::new(AtomicU64::new(0)),
            popped_total: CachePadded::new(AtomicU64::new(0)),
            domain: HazardDomain::with_threshold(retire_threshold),
            segment_capacity: capacity,
        }
    }

    /// Enqueue an item. Never fails; allocates a new segment when the head
    /// segment stops admitting tickets.
    pub fn push(&self, value: T) {
        let w = value.into_word();
        let cap = self.segment_capacity as u64;
        let guard = self.domain.acquire();
        let mut spare: *mut Segment<T> = ptr::null_mut();

        loop {
            let head = guard.protect(&self.head);
            if !head.is_null() {
                let seg = unsafe { &*head };
                let ticket = seg.tickets.fetch_add(1, Ordering::AcqRel);
                if ticket < cap {
                    // A claimed ticket always finds room: at most `cap`
                    // tickets ever publish into a segment.
                    let pushed = seg.ring.push_raw(w);
                    debug_assert!(pushed);
                    self.pushed_total.fetch_add(1, Ordering::AcqRel);
                    break;
                }
            }

            if spare.is_null() {
                spare = Segment::boxed(self.segment_capacity);
            }

            match self
                .head
                .compare_exchange(head, spare, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if head.is_null() {
                        let _ = self.tail.compare_exchange(
                            ptr::null_mut(),
                            spare,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    } else {
                        unsafe { &*head }.next.store(spare, Ordering::Release);
                    }
                    spare = ptr::null_mut();
                }
                Err(_) => {
                    // Lost the install race; keep the allocation around.
                }
            }
        }

        if !spare.is_null() {
            drop(unsafe { Box::from_raw(spare) });
        }
    }

    /// Dequeue an item. Returns `None` iff the queue is observed empty.
    ///
    /// A pop racing an in-flight push on an earlier segment may observe
    /// empty even though a later segment already holds items; callers that
    /// gate on [`SegQueue::is_empty`] simply retry.
    pub fn pop(&self) -> Option<T> {
        let cap = self.segment_capacity as u64;
        let guard = self.domain.acquire();
        let backoff = Backoff::new();

        loop {
            let tail = guard.protect(&self.tail);
            if tail.is_null() {
                return None;
            }
            let seg = unsafe { &*tail };

            if let Some(w) = seg.ring.pop_raw() {
                seg.popped.fetch_add(1, Ordering::AcqRel);
                self.popped_total.fetch_add(1, Ordering::AcqRel);
                // Safety: stored by push of the same T, transferred once.
                return Some(unsafe { T::from_word(w) });
            }

            if seg.popped.load(Ordering::Acquire) < cap {
                // Not exhausted: genuinely empty here, or a claimed ticket
                // has not published yet. Either way nothing to take.
                return None;
            }

            // Exhausted segment. Move the tail past it and retire it.
            let next = seg.next.load(Ordering::Acquire);
            if next.is_null() {
                if ptr::eq(self.head.load(Ordering::Acquire), tail) {
                    // No newer segment exists.
                    return None;
                }
                // A producer installed a new head but has not linked
                // `next` yet; it will momentarily.
                backoff.snooze();
                continue;
            }

            if self
                .tail
                .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // A straggler may still hold the segment; defer the free.
                unsafe {
                    self.domain.retire(tail, |seg| {
                        drop(Box::from_raw(seg));
                    });
                }
            }
        }
    }

    /// Number of queued items (approximate under concurrency).
    pub fn len(&self) -> usize {
        let pushed = self.pushed_total.load(Ordering::Acquire);
        let popped = self.popped_total.load(Ordering::Acquire);
        pushed.saturating_sub(popped) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queue's hazard domain, exposed for tests and diagnostics.
    pub fn hazard_domain(&self) -> &HazardDomain {
        &self.domain
    }

    /// Number of live (attached) segments. Only meaningful at quiescence.
    #[cfg(test)]
    fn segments(&self) -> usize {
        let mut count = 0;
        let mut cur = self.tail.load(Ordering::Acquire);
        while !cur.is_null() {
            count += 1;
            cur = unsafe { &*cur }.next.load(Ordering::Acquire);
        }
        count
    }
}

impl<T: Word> Default for SegQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Word> Drop for SegQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drain remaining items, then free the chain.
        while self.pop().is_some() {}
        let mut cur = *self.tail.get_mut();
        while !cur.is_null() {
            let seg = unsafe { Box::from_raw(cur) };
            cur = seg.next.load(Ordering::Relaxed);
        }
        // Detached segments still sit in the domain; its drop frees them.
    }
}
