//! Hazard-pointer domain.
//!
//! Readers of a lock-free structure publish the pointer they are about to
//! dereference into a protection slot; writers that detach a node hand it to
//! [`HazardDomain::retire`] instead of freeing it. Retired nodes are freed by
//! a scan once no protection slot references them, so a reader never touches
//! freed memory and the amount of deferred garbage is bounded by the
//! retirement threshold plus the number of live protectors.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Default number of retired nodes that triggers a reclamation scan.
pub const DEFAULT_RETIRE_THRESHOLD: usize = 1000;

/// One protection slot. Slots are allocated once and then recycled through
/// the `active` flag; the slot list only ever grows.
struct Slot {
    protected: AtomicPtr<u8>,
    active: AtomicBool,
    next: AtomicPtr<Slot>,
}

/// A node awaiting reclamation.
struct Retired {
    ptr: *mut u8,
    destroy: Box<dyn FnOnce() + Send>,
}

// Safety: `ptr` is only compared against protection slots, never
// dereferenced; `destroy` is Send by bound.
unsafe impl Send for Retired {}

/// A domain of protection slots plus a retirement list.
pub struct HazardDomain {
    slots: AtomicPtr<Slot>,
    retired: Mutex<Vec<Retired>>,
    retired_len: AtomicUsize,
    threshold: usize,
}

impl HazardDomain {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_RETIRE_THRESHOLD)
    }

    /// A domain that scans once `threshold` retired nodes accumulate.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            slots: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
            retired_len: AtomicUsize::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Acquire a protection slot. The returned guard releases it on drop.
    pub fn acquire(&self) -> HazardGuard<'_> {
        // Reuse a free slot if one exists.
        let mut cur = self.slots.load(Ordering::Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            if slot
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return HazardGuard { domain: self, slot };
            }
            cur = slot.next.load(Ordering::Acquire);
        }

        // All busy: push a fresh slot onto the list head.
        let slot = Box::into_raw(Box::new(Slot {
            protected: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let mut head = self.slots.load(Ordering::Acquire);
        loop {
            unsafe { &*slot }.next.store(head, Ordering::Relaxed);
            match self
                .slots
                .compare_exchange_weak(head, slot, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        HazardGuard {
            domain: self,
            slot: unsafe { &*slot },
        }
    }

    /// Whether any protection slot currently holds `ptr`.
    pub fn is_hazard(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let mut cur = self.slots.load(Ordering::Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            if slot.active.load(Ordering::Acquire)
                && ptr::eq(slot.protected.load(Ordering::Acquire), ptr as *mut u8)
            {
                return true;
            }
            cur = slot.next.load(Ordering::Acquire);
        }
        false
    }

    /// Hand a detached node to the domain for deferred destruction.
    ///
    /// `destroy` runs once no protection slot holds `ptr` anymore, during
    /// some later scan (or at domain drop).
    ///
    /// # Safety
    /// `ptr` must be detached: unreachable for new readers, so the set of
    /// protectors can only shrink. `destroy` must free it exactly once.
    pub unsafe fn retire<T>(&self, ptr: *mut T, destroy: impl FnOnce(*mut T) + Send + 'static) {
        // Carried as an address so the closure stays Send.
        let addr = ptr as usize;
        self.retired.lock().push(Retired {
            ptr: addr as *mut u8,
            destroy: Box::new(move || destroy(addr as *mut T)),
        });
        let len = self.retired_len.fetch_add(1, Ordering::AcqRel) + 1;
        if len >= self.threshold {
            self.scan();
        }
    }

    /// Free every retired node that is not currently protected.
    pub fn cleanup(&self) {
        self.scan();
    }

    /// How many retired nodes are still awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.retired_len.load(Ordering::Acquire)
    }

    fn scan(&self) {
        let drained: Vec<Retired> = {
            let mut retired = self.retired.lock();
            std::mem::take(&mut *retired)
        };
        let total = drained.len();
        let mut kept = Vec::new();
        for node in drained {
            if self.is_hazard(node.ptr) {
                kept.push(node);
            } else {
                (node.destroy)();
            }
        }
        tracing::trace!(freed = total - kept.len(), kept = kept.len(), "hazard scan");
        let mut retired = self.retired.lock();
        retired.extend(kept);
        self.retired_len.store(retired.len(), Ordering::Release);
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // No guard can outlive the domain, so nothing is protected anymore.
        for node in std::mem::take(&mut *self.retired.lock()) {
            (node.destroy)();
        }
        let mut cur = *self.slots.get_mut();
        while !cur.is_null() {
            let slot = unsafe { Box::from_raw(cur) };
            cur = slot.next.load(Ordering::Relaxed);
        }
    }
}

/// An owned protection slot. Dropping the guard clears the slot and returns
/// it to the domain's free pool.
pub struct HazardGuard<'d> {
    domain: &'d HazardDomain,
    slot: &'d Slot,
}

impl HazardGuard<'_> {
    /// Publish-then-verify protection of the pointer behind `src`.
    ///
    /// Loops until the published pointer and the source agree, then returns
    /// the stable pointer. A null result means the source is null.
    pub fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut observed = src.load(Ordering::Acquire);
        loop {
            self.slot
                .protected
                .store(observed as *mut u8, Ordering::SeqCst);
            let current = src.load(Ordering::SeqCst);
            if ptr::eq(current, observed) {
                return observed;
            }
            observed = current;
        }
    }

    /// Clear the published pointer without releasing the slot.
    pub fn reset(&self) {
        self.slot.protected.store(ptr::null_mut(), Ordering::Release);
    }

    /// The domain this guard belongs to.
    pub fn domain(&self) -> &HazardDomain {
        self.domain
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        self.slot.protected.store(ptr::null_mut(), Ordering::Release);
        self.slot.active.store(false, Ordering::Release);
    }
}
