//! Task-id-keyed heterogeneous value store.
//!
//! Each slot records the payload pointer, the value's [`TypeId`] tag and a
//! monomorphized drop thunk; payload memory comes from the scheduler-owned
//! [`BlockAllocator`]. Reads type-check against the tag, so a consumer asking
//! for the wrong type gets [`ValueStoreError::TypeMismatch`] instead of a
//! reinterpreted payload.
//!
//! The store is **not thread-safe per slot**: at most one thread may touch a
//! given id at a time. The scheduler derives this exclusivity from the DAG's
//! happens-before order (a producer writes strictly before its consumers
//! read, and a single consumer is the only mover). The atomic length counter
//! exists so `len`/`is_empty` stay callable concurrently.

use std::any::TypeId;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use weft_core::alloc::BlockAllocator;
use weft_core::error::ValueStoreError;
use weft_core::TaskId;

struct ValueSlot {
    ptr: *mut u8,
    type_id: TypeId,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

impl ValueSlot {
    fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            type_id: TypeId::of::<()>(),
            drop_fn: None,
        }
    }

    fn is_occupied(&self) -> bool {
        self.drop_fn.is_some()
    }
}

unsafe fn drop_thunk<T>(ptr: *mut u8) {
    unsafe { std::ptr::drop_in_place(ptr as *mut T) }
}

/// Sparse mapping from [`TaskId`] to one typed value.
pub struct ValueStore {
    slots: RwLock<Vec<UnsafeCell<ValueSlot>>>,
    len: AtomicUsize,
    alloc: Arc<BlockAllocator>,
}

// Safety: slot payloads are Send (enforced by `put`); per-slot exclusivity
// is the caller's contract documented on the type.
unsafe impl Send for ValueStore {}
unsafe impl Sync for ValueStore {}

impl ValueStore {
    pub fn new(alloc: Arc<BlockAllocator>) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            len: AtomicUsize::new(0),
            alloc,
        }
    }

    /// Grow the slot table to cover ids `0..capacity`. Never shrinks.
    pub fn resize(&self, capacity: usize) {
        let mut slots = self.slots.write();
        while slots.len() < capacity {
            slots.push(UnsafeCell::new(ValueSlot::empty()));
        }
    }

    /// Move `value` into the slot for `id`, destroying any previous value.
    ///
    /// Ids beyond the table are ignored, matching the scheduler's contract
    /// that slots are sized in `add_task`.
    pub fn put<T: Send + 'static>(&self, id: TaskId, value: T) {
        let slots = self.slots.read();
        let Some(cell) = slots.get(id.raw()) else {
            return;
        };
        let slot = unsafe { &mut *cell.get() };
        if slot.is_occupied() {
            unsafe { self.destroy_slot(slot) };
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        let ptr = self.alloc.alloc_value(value);
        *slot = ValueSlot {
            ptr: ptr.as_ptr() as *mut u8,
            type_id: TypeId::of::<T>(),
            drop_fn: Some(drop_thunk::<T>),
        };
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Borrow the value stored for `id`.
    pub fn get<T: 'static>(&self, id: TaskId) -> Result<&T, ValueStoreError> {
        let slots = self.slots.read();
        let cell = slots.get(id.raw()).ok_or(ValueStoreError::NotFound)?;
        let slot = unsafe { &*cell.get() };
        if !slot.is_occupied() {
            return Err(ValueStoreError::NotFound);
        }
        if slot.type_id != TypeId::of::<T>() {
            return Err(ValueStoreError::TypeMismatch);
        }
        // The reference points into the arena, which outlives the borrow of
        // `self`; growing the slot table never moves payloads.
        Ok(unsafe { &*(slot.ptr as *const T) })
    }

    /// Move the value out of the slot for `id`, freeing it.
    pub fn consume<T: 'static>(&self, id: TaskId) -> Result<T, ValueStoreError> {
        let slots = self.slots.read();
        let cell = slots.get(id.raw()).ok_or(ValueStoreError::NotFound)?;
        let slot = unsafe { &mut *cell.get() };
        if !slot.is_occupied() {
            return Err(ValueStoreError::NotFound);
        }
        if slot.type_id != TypeId::of::<T>() {
            return Err(ValueStoreError::TypeMismatch);
        }
        let ptr = slot.ptr as *mut T;
        *slot = ValueSlot::empty();
        self.len.fetch_sub(1, Ordering::AcqRel);
        // Safety: tag matched, slot cleared; sole mover by store contract.
        let value = unsafe { self.alloc.take_value(NonNull::new_unchecked(ptr)) };
        Ok(value)
    }

    /// Destroy the value stored for `id`, if any.
    pub fn remove(&self, id: TaskId) {
        let slots = self.slots.read();
        let Some(cell) = slots.get(id.raw()) else {
            return;
        };
        let slot = unsafe { &mut *cell.get() };
        if slot.is_occupied() {
            unsafe { self.destroy_slot(slot) };
            *slot = ValueSlot::empty();
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// The opaque type tag of the value stored for `id`.
    pub fn get_type(&self, id: TaskId) -> Option<TypeId> {
        let slots = self.slots.read();
        let cell = slots.get(id.raw())?;
        let slot = unsafe { &*cell.get() };
        slot.is_occupied().then_some(slot.type_id)
    }

    /// Destroy every value. With `reuse` the arena keeps its blocks for the
    /// next run; without it the blocks are freed.
    pub fn clear(&self, reuse: bool) {
        let slots = self.slots.write();
        for cell in slots.iter() {
            let slot = unsafe { &mut *cell.get() };
            if slot.is_occupied() {
                // The arena is reset below; only run destructors here.
                if let Some(drop_fn) = slot.drop_fn {
                    unsafe { drop_fn(slot.ptr) };
                }
                *slot = ValueSlot::empty();
            }
        }
        self.alloc.reset(reuse);
        self.len.store(0, Ordering::Release);
    }

    /// Number of stored values. Safe to call concurrently.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of addressable slots.
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    unsafe fn destroy_slot(&self, slot: &mut ValueSlot) {
        if let Some(drop_fn) = slot.drop_fn.take() {
            unsafe {
                drop_fn(slot.ptr);
                self.alloc
                    .dealloc(NonNull::new_unchecked(slot.ptr));
            }
        }
    }
}

impl Drop for ValueStore {
    fn drop(&mut self) {
        self.clear(false);
    }
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
