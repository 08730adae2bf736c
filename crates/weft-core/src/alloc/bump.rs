//! Single-buffer bump arena.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

use crate::sync::dword::{pack, unpack, AtomicDWord, Ordering};
use crate::util::align_up;

/// Maximum alignment the arena serves without falling back to the caller.
const BUFFER_ALIGN: usize = 16;

/// A contiguous buffer with an atomic `(refcount, cursor)` pair.
///
/// `alloc` bumps the cursor and the count together; `dealloc` only drops the
/// count. When the count returns to zero the cursor resets, so the arena
/// recycles itself once all outstanding allocations are gone. There is no
/// per-allocation reuse; amortizing that is the block allocator's job.
pub struct BumpArena {
    mem: NonNull<u8>,
    size: usize,
    state: AtomicDWord,
}

// Safety: the buffer is only handed out through the atomic cursor protocol;
// each allocation is an exclusive byte range.
unsafe impl Send for BumpArena {}
unsafe impl Sync for BumpArena {}

impl BumpArena {
    /// Allocate an owned arena of `size` bytes.
    ///
    /// # Panics
    /// On a zero size or if the host allocator fails.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "arena size must be non-zero");
        let layout = Layout::from_size_align(size, BUFFER_ALIGN).expect("arena layout");
        let mem = unsafe { alloc(layout) };
        let mem = NonNull::new(mem).expect("arena allocation failed");
        Self {
            mem,
            size,
            state: AtomicDWord::zero(),
        }
    }

    /// Carve `layout.size()` bytes out of the buffer.
    ///
    /// Returns `None` when the remaining space cannot fit the request.
    pub fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let base = self.mem.as_ptr() as usize;
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (count, cursor) = unpack(current);

            let start = align_up(base + cursor as usize, layout.align().max(1));
            let end = start + layout.size().max(1);
            if end > base + self.size {
                return None;
            }

            let next = pack(count + 1, (end - base) as u64);
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return NonNull::new(start as *mut u8);
            }
        }
    }

    /// Release one allocation. When the last one goes, the cursor resets and
    /// the whole buffer becomes available again.
    ///
    /// Returns true when this call reset the arena.
    ///
    /// # Safety
    /// `ptr` must come from [`BumpArena::alloc`] on this arena and be
    /// released exactly once, with its contents already dropped.
    pub unsafe fn dealloc(&self, ptr: NonNull<u8>) -> bool {
        debug_assert!(self.contains(ptr.as_ptr()));
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (count, cursor) = unpack(current);
            debug_assert!(count > 0, "dealloc without outstanding allocation");
            let next = if count <= 1 {
                pack(0, 0)
            } else {
                pack(count - 1, cursor)
            };
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return count <= 1;
            }
        }
    }

    /// Grow or shrink the most recent allocation in place.
    ///
    /// Only the allocation whose end coincides with the cursor can resize in
    /// place; anywhere else a shrink is a no-op and a grow returns `None`
    /// so the caller falls back to alloc-and-copy.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of `old_size` bytes from this arena.
    pub unsafe fn realloc_in_place(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if old_size == new_size {
            return Some(ptr);
        }
        let base = self.mem.as_ptr() as usize;
        let end_offset = (ptr.as_ptr() as usize - base) + old_size;
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (count, cursor) = unpack(current);
            if cursor as usize != end_offset {
                // Not the most recent allocation.
                return if new_size < old_size { Some(ptr) } else { None };
            }
            let new_end = end_offset - old_size + new_size;
            if new_end > self.size {
                return None;
            }
            let next = pack(count, new_end as u64);
            if self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ptr);
            }
        }
    }

    /// Whether `ptr` points into this arena's buffer.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.mem.as_ptr() as usize;
        let p = ptr as usize;
        p >= base && p < base + self.size
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes left between the cursor and the end of the buffer.
    pub fn free_space(&self) -> usize {
        let (_, cursor) = self.state.load_pair(Ordering::Acquire);
        self.size - cursor as usize
    }

    /// Whether no allocation is outstanding.
    pub fn is_empty(&self) -> bool {
        let (count, _) = self.state.load_pair(Ordering::Acquire);
        count == 0
    }

    /// Outstanding allocation count.
    pub fn outstanding(&self) -> usize {
        let (count, _) = self.state.load_pair(Ordering::Acquire);
        count as usize
    }

    /// Snapshot of the `(refcount, cursor)` pair.
    pub fn marker(&self) -> (u64, u64) {
        self.state.load_pair(Ordering::Acquire)
    }

    /// Restore a previously captured marker. Callers must be quiescent.
    pub fn set_marker(&self, marker: (u64, u64)) {
        self.state.store(pack(marker.0, marker.1), Ordering::Release);
    }

    /// Forget every allocation and rewind the cursor.
    pub fn reset(&self) {
        self.state.store(0, Ordering::Release);
    }
}

impl Drop for BumpArena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, BUFFER_ALIGN).expect("arena layout");
        unsafe { dealloc(self.mem.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for BumpArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (count, cursor) = self.marker();
        f.debug_struct("BumpArena")
            .field("size", &self.size)
            .field("outstanding", &count)
            .field("cursor", &cursor)
            .finish()
    }
}
