//! Bounded MPMC ring buffer.
//!
//! A fixed-capacity lock-free queue of machine-word-sized items. Every slot
//! holds a `(sequence, value)` pair in one [`AtomicDWord`]; the sequence
//! encodes the slot's lap and occupancy so producers and consumers agree on
//! ownership without touching a shared lock:
//!
//! - `seq == idx << 1`: empty, a producer may claim it,
//! - `seq == (idx << 1) | 1`: full, a consumer may claim it,
//! - `seq == (idx + N) << 1`: consumed, the next lap's producer writes it.
//!
//! `head`/`tail` are advisory cursors: a thread that finds the cursor lagging
//! behind the slot state helps advance it instead of spinning on the loser.
//! Items larger than a machine word travel boxed, with the ring storing the
//! pointer (see the [`Word`] impl for `Box<T>`).

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sync::dword::{pack, unpack, AtomicDWord};
use crate::util::is_power_of_two;

/// Items that fit in one machine word and may travel through a ring.
///
/// # Safety
///
/// `from_word` must only be called with a value produced by `into_word` of
/// the same type, and each such value must be consumed exactly once;
/// the ring transfers ownership through the raw word.
pub unsafe trait Word: Sized {
    fn into_word(self) -> u64;
    /// # Safety
    /// `w` must come from [`Word::into_word`] of `Self` and be consumed once.
    unsafe fn from_word(w: u64) -> Self;
}

macro_rules! impl_word_for_int {
    ($($t:ty),+) => {
        $(unsafe impl Word for $t {
            #[inline]
            fn into_word(self) -> u64 {
                self as u64
            }
            #[inline]
            unsafe fn from_word(w: u64) -> Self {
                w as $t
            }
        })+
    };
}

impl_word_for_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

unsafe impl<T> Word for *mut T {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    unsafe fn from_word(w: u64) -> Self {
        w as *mut T
    }
}

unsafe impl<T> Word for *const T {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }
    #[inline]
    unsafe fn from_word(w: u64) -> Self {
        w as *const T
    }
}

unsafe impl<T> Word for Box<T> {
    #[inline]
    fn into_word(self) -> u64 {
        Box::into_raw(self) as u64
    }
    #[inline]
    unsafe fn from_word(w: u64) -> Self {
        // Safety: per trait contract the word is an unconsumed into_raw result.
        unsafe { Box::from_raw(w as *mut T) }
    }
}

unsafe impl Word for crate::task_id::TaskId {
    #[inline]
    fn into_word(self) -> u64 {
        self.raw() as u64
    }
    #[inline]
    unsafe fn from_word(w: u64) -> Self {
        crate::task_id::TaskId::from_raw(w as usize)
    }
}

/// Fixed-capacity lock-free MPMC queue.
pub struct RingBuffer<T: Word> {
    slots: Box<[CachePadded<AtomicDWord>]>,
    mask: u64,
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    _marker: std::marker::PhantomData<T>,
}

// Safety: items are transferred by value through atomic slots; the slot
// sequence protocol hands each stored word to exactly one consumer.
unsafe impl<T: Word + Send> Send for RingBuffer<T> {}
unsafe impl<T: Word + Send> Sync for RingBuffer<T> {}

impl<T: Word> RingBuffer<T> {
    /// Create a ring with the given power-of-two capacity.
    ///
    /// # Panics
    /// If `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            is_power_of_two(capacity),
            "ring capacity must be a non-zero power of two"
        );
        let slots = (0..capacity)
            .map(|i| CachePadded::new(AtomicDWord::from_pair((i as u64) << 1, 0)))
            .collect();
        Self {
            slots,
            mask: capacity as u64 - 1,
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            _marker: std::marker::PhantomData,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Enqueue an item. Returns the item back iff the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let w = value.into_word();
        if self.push_raw(w) {
            Ok(())
        } else {
            // Safety: the word was produced by into_word above and was not
            // stored anywhere.
            Err(unsafe { T::from_word(w) })
        }
    }

    /// Enqueue a pre-encoded word. Returns false iff the ring is full.
    pub fn push_raw(&self, value: u64) -> bool {
        let n = self.slots.len() as u64;
        loop {
            let t = self.tail.load(Ordering::Relaxed);
            let slot = &self.slots[(t & self.mask) as usize];
            let entry = slot.load(Ordering::Acquire);
            let (seq, _) = unpack(entry);

            let empty_seq = t << 1;
            let full_seq = empty_seq | 1;
            let lapped_seq = (t + n) << 1;

            if seq == empty_seq {
                if slot
                    .compare_exchange(
                        pack(empty_seq, 0),
                        pack(full_seq, value),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        t,
                        t + 1,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return true;
                }
            } else if seq == full_seq || seq == lapped_seq {
                // Another producer claimed this slot but has not advanced the
                // cursor yet; help it along.
                let _ = self
                    .tail
                    .compare_exchange(t, t + 1, Ordering::Release, Ordering::Relaxed);
            } else if full_seq == seq + (n << 1) {
                // The slot still holds last lap's unconsumed item.
                return false;
            }
            // Any other sequence means the cursor moved under us; retry.
        }
    }

    /// Dequeue an item. Returns `None` iff the ring is empty.
    pub fn pop(&self) -> Option<T> {
        // Safety: the word was stored by push of the same `T` and the slot
        // CAS transferred it to us exclusively.
        self.pop_raw().map(|w| unsafe { T::from_word(w) })
    }

    /// Dequeue a pre-encoded word.
    pub fn pop_raw(&self) -> Option<u64> {
        let n = self.slots.len() as u64;
        loop {
            let h = self.head.load(Ordering::Relaxed);
            let slot = &self.slots[(h & self.mask) as usize];
            let entry = slot.load(Ordering::Acquire);
            let (seq, value) = unpack(entry);

            let empty_seq = h << 1;
            let full_seq = empty_seq | 1;
            let consumed_seq = (h + n) << 1;

            if seq == full_seq {
                if slot
                    .compare_exchange(
                        entry,
                        pack(consumed_seq, 0),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    let _ = self.head.compare_exchange(
                        h,
                        h + 1,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return Some(value);
                }
            } else if seq | 1 == consumed_seq | 1 {
                // Already consumed this lap; help advance the cursor.
                let _ = self
                    .head
                    .compare_exchange(h, h + 1, Ordering::Release, Ordering::Relaxed);
            } else if seq == empty_seq {
                return None;
            }
            // Otherwise the cursor moved under us; retry.
        }
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        let t = self.tail.load(Ordering::Acquire);
        let h = self.head.load(Ordering::Acquire);
        t.saturating_sub(h) as usize
    }

    /// Whether the slot under the head cursor is empty.
    pub fn is_empty(&self) -> bool {
        let h = self.head.load(Ordering::Acquire);
        let (seq, _) = self.slots[(h & self.mask) as usize].load_pair(Ordering::Acquire);
        seq == h << 1
    }

    /// Whether the ring currently holds `capacity` items.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Drop every queued item and reset the cursors.
    ///
    /// Exclusive access via `&mut` rules out concurrent producers/consumers.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        for (i, slot) in self.slots.iter().enumerate() {
            slot.store(pack((i as u64) << 1, 0), Ordering::Relaxed);
        }
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }
}

impl<T: Word> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
