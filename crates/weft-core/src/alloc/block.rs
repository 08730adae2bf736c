//! Chained-arena block allocator.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::alloc::bump::BumpArena;

/// Default size of one arena block.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

struct Block {
    arena: BumpArena,
    next: AtomicPtr<Block>,
}

/// A lock-free linked list of bump arenas.
///
/// Allocation walks the chain front to back and CAS-links a fresh block in
/// front when every arena is exhausted. Deallocation locates the owning
/// block by address containment. The typed helpers move whole values in and
/// out, which is how the value store and the side-work queue use it.
pub struct BlockAllocator {
    root: CachePadded<AtomicPtr<Block>>,
    block_size: usize,
}

// Safety: block chain mutations go through atomics; arenas are Sync.
unsafe impl Send for BlockAllocator {}
unsafe impl Sync for BlockAllocator {}

/// A resume point captured by [`BlockAllocator::marker`]; restoring it
/// discards every block allocated since.
pub struct ArenaMarker {
    block: *mut Block,
    state: (u64, u64),
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            root: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            block_size: block_size.max(4096),
        }
    }

    /// Allocate raw bytes.
    pub fn alloc(&self, layout: Layout) -> NonNull<u8> {
        loop {
            // Fast path: some existing block has room.
            let mut cur = self.root.load(Ordering::Acquire);
            while !cur.is_null() {
                let block = unsafe { &*cur };
                if let Some(p) = block.arena.alloc(layout) {
                    return p;
                }
                cur = block.next.load(Ordering::Acquire);
            }

            // Chain exhausted: link a block sized for the request.
            let size = self.block_size.max(layout.size().saturating_mul(2));
            let node = Box::into_raw(Box::new(Block {
                arena: BumpArena::new(size),
                next: AtomicPtr::new(ptr::null_mut()),
            }));
            let root = self.root.load(Ordering::Acquire);
            unsafe { &*node }.next.store(root, Ordering::Relaxed);
            if self
                .root
                .compare_exchange(root, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The fresh block cannot fail the allocation.
                if let Some(p) = unsafe { &*node }.arena.alloc(layout) {
                    return p;
                }
            } else {
                drop(unsafe { Box::from_raw(node) });
            }
        }
    }

    /// Move `value` into the arena and return its pointer.
    pub fn alloc_value<T>(&self, value: T) -> NonNull<T> {
        let p = self.alloc(Layout::new::<T>()).cast::<T>();
        unsafe { p.as_ptr().write(value) };
        p
    }

    /// Release raw bytes previously returned by [`BlockAllocator::alloc`].
    ///
    /// Returns false if the pointer does not belong to this allocator.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and be released exactly once,
    /// with its contents already dropped.
    pub unsafe fn dealloc(&self, ptr: NonNull<u8>) -> bool {
        let mut cur = self.root.load(Ordering::Acquire);
        while !cur.is_null() {
            let block = unsafe { &*cur };
            if block.arena.contains(ptr.as_ptr()) {
                unsafe { block.arena.dealloc(ptr) };
                return true;
            }
            cur = block.next.load(Ordering::Acquire);
        }
        false
    }

    /// Move the value out of the arena and release its slot.
    ///
    /// # Safety
    /// `ptr` must hold a live `T` from [`BlockAllocator::alloc_value`],
    /// not yet taken or dropped.
    pub unsafe fn take_value<T>(&self, ptr: NonNull<T>) -> T {
        let value = unsafe { ptr.as_ptr().read() };
        unsafe { self.dealloc(ptr.cast()) };
        value
    }

    /// Drop the value in the arena and release its slot.
    ///
    /// # Safety
    /// Same contract as [`BlockAllocator::take_value`].
    pub unsafe fn drop_value<T>(&self, ptr: NonNull<T>) {
        unsafe { ptr.as_ptr().drop_in_place() };
        unsafe { self.dealloc(ptr.cast()) };
    }

    /// Number of chained blocks.
    pub fn blocks(&self) -> usize {
        let mut count = 0;
        let mut cur = self.root.load(Ordering::Acquire);
        while !cur.is_null() {
            count += 1;
            cur = unsafe { &*cur }.next.load(Ordering::Acquire);
        }
        count
    }

    /// Total bytes owned across all blocks.
    pub fn total_capacity(&self) -> usize {
        let mut total = 0;
        let mut cur = self.root.load(Ordering::Acquire);
        while !cur.is_null() {
            let block = unsafe { &*cur };
            total += block.arena.size();
            cur = block.next.load(Ordering::Acquire);
        }
        total
    }

    /// Outstanding allocations across all blocks.
    pub fn outstanding(&self) -> usize {
        let mut total = 0;
        let mut cur = self.root.load(Ordering::Acquire);
        while !cur.is_null() {
            let block = unsafe { &*cur };
            total += block.arena.outstanding();
            cur = block.next.load(Ordering::Acquire);
        }
        total
    }

    /// Capture the current front block and its cursor.
    pub fn marker(&self) -> ArenaMarker {
        let block = self.root.load(Ordering::Acquire);
        let state = if block.is_null() {
            (0, 0)
        } else {
            unsafe { &*block }.arena.marker()
        };
        ArenaMarker { block, state }
    }

    /// Restore a marker, freeing every block linked in front of it since.
    /// Callers must be quiescent.
    pub fn set_marker(&self, marker: ArenaMarker) {
        if marker.block.is_null() {
            self.reset_chain(true);
            return;
        }
        unsafe { &*marker.block }.arena.set_marker(marker.state);
        let mut cur = self.root.swap(marker.block, Ordering::AcqRel);
        while !cur.is_null() && !ptr::eq(cur, marker.block) {
            let block = unsafe { Box::from_raw(cur) };
            cur = block.next.load(Ordering::Relaxed);
        }
    }

    /// Forget all allocations. With `reuse` the blocks stay around for the
    /// next round; without it the whole chain is freed.
    ///
    /// Callers must be quiescent and must have dropped all stored values.
    pub fn reset(&self, reuse: bool) {
        self.reset_chain(!reuse);
    }

    fn reset_chain(&self, free: bool) {
        if free {
            let mut cur = self.root.swap(ptr::null_mut(), Ordering::AcqRel);
            while !cur.is_null() {
                let block = unsafe { Box::from_raw(cur) };
                cur = block.next.load(Ordering::Relaxed);
            }
        } else {
            let mut cur = self.root.load(Ordering::Acquire);
            while !cur.is_null() {
                let block = unsafe { &*cur };
                block.arena.reset();
                cur = block.next.load(Ordering::Acquire);
            }
        }
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        self.reset_chain(true);
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("blocks", &self.blocks())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_value_roundtrip() {
        let alloc = BlockAllocator::with_block_size(4096);
        let p = alloc.alloc_value(vec![1u32, 2, 3]);
        assert_eq!(alloc.outstanding(), 1);
        let v = unsafe { alloc.take_value(p) };
        assert_eq!(v, vec![1, 2, 3]);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_grows_new_blocks() {
        let alloc = BlockAllocator::with_block_size(4096);
        let mut ptrs = Vec::new();
        for i in 0..8 {
            ptrs.push(alloc.alloc_value([i as u8; 1024]));
        }
        assert!(alloc.blocks() >= 2);
        for (i, p) in ptrs.into_iter().enumerate() {
            let v = unsafe { alloc.take_value(p) };
            assert_eq!(v[0], i as u8);
        }
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_oversized_request_gets_own_block() {
        let alloc = BlockAllocator::with_block_size(4096);
        let p = alloc.alloc_value([0u8; 16 * 1024]);
        assert!(alloc.total_capacity() >= 32 * 1024);
        unsafe { alloc.drop_value(p) };
    }

    #[test]
    fn test_dealloc_foreign_pointer() {
        let alloc = BlockAllocator::with_block_size(4096);
        let _p = alloc.alloc_value(1u64);
        let foreign = Box::into_raw(Box::new(0u8));
        assert!(!unsafe { alloc.dealloc(NonNull::new(foreign).unwrap()) });
        drop(unsafe { Box::from_raw(foreign) });
    }

    #[test]
    fn test_marker_discards_trailing_blocks() {
        let alloc = BlockAllocator::with_block_size(4096);
        let a = alloc.alloc_value(7u64);
        let marker = alloc.marker();
        // Force extra blocks.
        for _ in 0..4 {
            let _ = alloc.alloc_value([0u8; 2048]);
        }
        assert!(alloc.blocks() > 1);
        alloc.set_marker(marker);
        assert_eq!(alloc.blocks(), 1);
        assert_eq!(unsafe { alloc.take_value(a) }, 7);
    }

    #[test]
    fn test_reset_with_reuse_keeps_blocks() {
        let alloc = BlockAllocator::with_block_size(4096);
        let _ = alloc.alloc_value(1u64);
        let blocks = alloc.blocks();
        alloc.reset(true);
        assert_eq!(alloc.blocks(), blocks);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_reset_without_reuse_frees_blocks() {
        let alloc = BlockAllocator::with_block_size(4096);
        let _ = alloc.alloc_value(1u64);
        alloc.reset(false);
        assert_eq!(alloc.blocks(), 0);
        let p = alloc.alloc_value(2u64);
        assert_eq!(unsafe { alloc.take_value(p) }, 2);
    }

    #[test]
    fn test_concurrent_alloc_dealloc() {
        let alloc = BlockAllocator::with_block_size(1 << 16);
        std::thread::scope(|s| {
            for t in 0..8u64 {
                let alloc = &alloc;
                s.spawn(move || {
                    for i in 0..500 {
                        let p = alloc.alloc_value(t * 1000 + i);
                        assert_eq!(unsafe { alloc.take_value(p) }, t * 1000 + i);
                    }
                });
            }
        });
        assert_eq!(alloc.outstanding(), 0);
    }
}
