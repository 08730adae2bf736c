//! Double-word atomic.
//!
//! A 128-bit atomic viewed as a `(first, second)` pair of 64-bit halves.
//! The ring buffer packs `(sequence, value)` entries into it, the bump arena
//! packs `(refcount, cursor)`, and the signal tree packs rows of counters so
//! that sibling updates land in a single compare-exchange.
//!
//! Backed by `portable-atomic`, which lowers to the native 128-bit CAS where
//! the target has one and to a CAS loop elsewhere.

pub use portable_atomic::Ordering;

/// Pack two 64-bit halves into one double word. `first` occupies the low
/// half, `second` the high half.
#[inline]
pub const fn pack(first: u64, second: u64) -> u128 {
    (first as u128) | ((second as u128) << 64)
}

/// Split a double word back into `(first, second)`.
#[inline]
pub const fn unpack(v: u128) -> (u64, u64) {
    (v as u64, (v >> 64) as u64)
}

/// A 128-bit atomic cell with pair-oriented helpers.
#[derive(Debug)]
pub struct AtomicDWord {
    inner: portable_atomic::AtomicU128,
}

impl AtomicDWord {
    /// A cell holding zero in both halves.
    #[inline]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    pub const fn new(v: u128) -> Self {
        Self {
            inner: portable_atomic::AtomicU128::new(v),
        }
    }

    /// A cell initialized from a `(first, second)` pair.
    #[inline]
    pub const fn from_pair(first: u64, second: u64) -> Self {
        Self::new(pack(first, second))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> u128 {
        self.inner.load(order)
    }

    /// Load and split into `(first, second)`.
    #[inline]
    pub fn load_pair(&self, order: Ordering) -> (u64, u64) {
        unpack(self.load(order))
    }

    #[inline]
    pub fn store(&self, v: u128, order: Ordering) {
        self.inner.store(v, order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: u128,
        new: u128,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u128, u128> {
        self.inner.compare_exchange(current, new, success, failure)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: u128,
        new: u128,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u128, u128> {
        self.inner
            .compare_exchange_weak(current, new, success, failure)
    }

    /// Add `v` to the whole 128-bit value, returning the previous value.
    ///
    /// Callers that treat the cell as packed bit fields must guarantee the
    /// addition cannot carry across a field boundary.
    #[inline]
    pub fn fetch_add(&self, v: u128, order: Ordering) -> u128 {
        self.inner.fetch_add(v, order)
    }

    /// Subtract `v` from the whole 128-bit value, returning the previous
    /// value. Same field-boundary caveat as [`fetch_add`](Self::fetch_add).
    #[inline]
    pub fn fetch_sub(&self, v: u128, order: Ordering) -> u128 {
        self.inner.fetch_sub(v, order)
    }

    #[inline]
    pub fn fetch_or(&self, v: u128, order: Ordering) -> u128 {
        self.inner.fetch_or(v, order)
    }

    #[inline]
    pub fn fetch_and(&self, v: u128, order: Ordering) -> u128 {
        self.inner.fetch_and(v, order)
    }
}

impl Default for AtomicDWord {
    fn default() -> Self {
        Self::zero()
    }
}
