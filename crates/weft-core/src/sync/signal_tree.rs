//! Hierarchical signal tree.
//!
//! A complete binary tree of counters over `N` slots (power of two) that
//! picks a ready slot in `log2(N)` steps instead of scanning a bitmap. Each
//! non-leaf counter holds the number of set leaves in its subtree; leaves
//! hold 0 or 1.
//!
//! Counter packing: the level at depth `d` (root = 0, leaves = `log2(N)`)
//! needs `log2(N) - d + 1` bits per counter. All counters of one level are
//! packed into 128-bit words through [`AtomicDWord`], with the per-word
//! counter count chosen so that no counter straddles a word; one CAS updates
//! one counter without disturbing its neighbors.
//!
//! Ordering: [`SignalTree::set`] publishes leaf-first and increments the
//! root last, so a non-zero root count proves the whole path below it is
//! already visible. [`SignalTree::select`] claims the root first and then
//! descends, which is why a successful root claim can always be converted
//! into a leaf.

use crossbeam_utils::Backoff;

use crate::sync::dword::{AtomicDWord, Ordering};
use crate::util::{is_power_of_two, log2};

const WORD_BITS: usize = 128;

struct Level {
    /// Bits per counter at this level.
    width: u32,
    /// Counters packed into one word.
    per_word: usize,
    words: Box<[AtomicDWord]>,
}

impl Level {
    fn new(nodes: usize, width: u32) -> Self {
        let per_word = WORD_BITS / width as usize;
        let word_count = nodes.div_ceil(per_word);
        Self {
            width,
            per_word,
            words: (0..word_count).map(|_| AtomicDWord::zero()).collect(),
        }
    }

    #[inline]
    fn location(&self, index: usize) -> (&AtomicDWord, u32, u128) {
        let word = &self.words[index / self.per_word];
        let shift = (index % self.per_word) as u32 * self.width;
        let mask = (1u128 << self.width) - 1;
        (word, shift, mask)
    }

    fn value(&self, index: usize) -> u64 {
        let (word, shift, mask) = self.location(index);
        ((word.load(Ordering::Acquire) >> shift) & mask) as u64
    }

    /// Unconditionally add one to the counter. The caller guarantees the
    /// counter stays below its subtree bound, so the add cannot carry into a
    /// neighbor.
    fn increment(&self, index: usize) -> u64 {
        let (word, shift, mask) = self.location(index);
        let prev = word.fetch_add(1u128 << shift, Ordering::AcqRel);
        ((prev >> shift) & mask) as u64
    }

    /// CAS the counter from 0 to 1. Returns false if it was already set.
    fn try_set_bit(&self, index: usize) -> bool {
        let (word, shift, mask) = self.location(index);
        let mut current = word.load(Ordering::Acquire);
        loop {
            if (current >> shift) & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current + (1u128 << shift),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(v) => current = v,
            }
        }
    }

    /// CAS-decrement the counter if it is non-zero. Returns the value the
    /// counter held before a successful decrement.
    fn try_decrement(&self, index: usize) -> Option<u64> {
        let (word, shift, mask) = self.location(index);
        let mut current = word.load(Ordering::Acquire);
        loop {
            let value = (current >> shift) & mask;
            if value == 0 {
                return None;
            }
            match word.compare_exchange_weak(
                current,
                current - (1u128 << shift),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(value as u64),
                Err(v) => current = v,
            }
        }
    }

    fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

/// Log-depth counting tree used to claim ready slots under contention.
pub struct SignalTree {
    levels: Box<[Level]>,
    capacity: usize,
    depth: u32,
}

impl SignalTree {
    /// Create a tree over `capacity` slots.
    ///
    /// # Panics
    /// If `capacity` is not a power of two or is less than 2.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            is_power_of_two(capacity) && capacity >= 2,
            "signal tree capacity must be a power of two >= 2"
        );
        let depth = log2(capacity);
        let levels = (0..=depth)
            .map(|d| Level::new(1 << d, depth - d + 1))
            .collect();
        Self {
            levels,
            capacity,
            depth,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark slot `index` ready.
    ///
    /// Idempotent: if the leaf is already set, ancestors are left untouched
    /// and `false` is returned. Otherwise the leaf and every ancestor up to
    /// the root are incremented and `true` is returned.
    pub fn set(&self, index: usize) -> bool {
        debug_assert!(index < self.capacity);
        let leaf_level = self.depth as usize;
        if !self.levels[leaf_level].try_set_bit(index) {
            return false;
        }
        // Leaf to root; the root increment is the publication point.
        for d in (0..leaf_level).rev() {
            self.levels[d].increment(index >> (leaf_level - d));
        }
        true
    }

    /// Atomically claim one ready slot.
    ///
    /// Returns the slot index and whether this claim emptied the tree.
    /// Tie-breaking is left-biased; dependencies, not fairness, dominate
    /// scheduling decisions.
    pub fn select(&self) -> Option<(usize, bool)> {
        let was_last = match self.levels[0].try_decrement(0) {
            Some(prev) => prev == 1,
            None => return None,
        };

        // A successful root claim guarantees one claimable unit in every
        // level below: increments run leaf-first, and each claimed parent
        // unit is backed by exactly one child unit.
        let mut index = 0;
        for level in &self.levels[1..] {
            let left = index << 1;
            let backoff = Backoff::new();
            index = loop {
                if level.try_decrement(left).is_some() {
                    break left;
                }
                if level.try_decrement(left | 1).is_some() {
                    break left | 1;
                }
                // Both children transiently contended; the unit cannot
                // vanish, so retry this level.
                backoff.spin();
            };
        }
        Some((index, was_last))
    }

    /// Whether no slot is ready.
    pub fn is_empty(&self) -> bool {
        self.levels[0].value(0) == 0
    }

    /// Number of ready slots.
    pub fn count(&self) -> usize {
        self.levels[0].value(0) as usize
    }

    /// Zero every counter. Callers must be quiescent.
    pub fn clear(&self) {
        for level in self.levels.iter() {
            level.clear();
        }
    }

    /// Check the per-node sum invariant; meaningful only at quiescence.
    #[cfg(test)]
    fn check_sums(&self) {
        for d in 0..self.depth as usize {
            let nodes = 1usize << d;
            for i in 0..nodes {
                let parent = self.levels[d].value(i);
                let children =
                    self.levels[d + 1].value(i << 1) + self.levels[d + 1].value((i << 1) | 1);
                assert_eq!(
                    parent, children,
                    "node {i} at depth {d}: parent {parent} != children {children}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_set_select_single() {
        let tree = SignalTree::with_capacity(8);
        assert!(tree.is_empty());
        assert!(tree.set(5));
        assert!(!tree.is_empty());
        assert_eq!(tree.count(), 1);
        assert_eq!(tree.select(), Some((5, true)));
        assert!(tree.is_empty());
        assert_eq!(tree.select(), None);
    }

    #[test]
    fn test_set_is_idempotent() {
        let tree = SignalTree::with_capacity(4);
        assert!(tree.set(2));
        assert!(!tree.set(2));
        assert_eq!(tree.count(), 1);
        tree.check_sums();
        assert_eq!(tree.select(), Some((2, true)));
        assert_eq!(tree.select(), None);
    }

    #[test]
    fn test_contended_slots_scenario() {
        // set(0), set(2), set(1), then three selects yield three distinct
        // slots from {0, 1, 2}; the fourth observes emptiness.
        let tree = SignalTree::with_capacity(4);
        tree.set(0);
        tree.set(2);
        tree.set(1);
        tree.check_sums();

        let mut picked = HashSet::new();
        for _ in 0..3 {
            let (slot, _) = tree.select().unwrap();
            assert!(picked.insert(slot));
        }
        assert!(picked.iter().all(|&s| s < 3));
        assert_eq!(tree.select(), None);
        assert!(tree.is_empty());
        tree.check_sums();
    }

    #[test]
    fn test_left_bias() {
        let tree = SignalTree::with_capacity(8);
        tree.set(6);
        tree.set(1);
        // Left subtree holds slot 1; the deterministic descent prefers it.
        assert_eq!(tree.select(), Some((1, false)));
        assert_eq!(tree.select(), Some((6, true)));
    }

    #[test]
    fn test_full_capacity_roundtrip() {
        let n = 64;
        let tree = SignalTree::with_capacity(n);
        for i in 0..n {
            assert!(tree.set(i));
        }
        assert_eq!(tree.count(), n);
        tree.check_sums();

        let mut picked = HashSet::new();
        while let Some((slot, _)) = tree.select() {
            assert!(picked.insert(slot));
        }
        assert_eq!(picked.len(), n);
        tree.check_sums();
    }

    #[test]
    fn test_was_last_flag() {
        let tree = SignalTree::with_capacity(4);
        tree.set(0);
        tree.set(3);
        assert_eq!(tree.select().unwrap().1, false);
        assert_eq!(tree.select().unwrap().1, true);
    }

    #[test]
    fn test_clear() {
        let tree = SignalTree::with_capacity(16);
        for i in 0..16 {
            tree.set(i);
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.select(), None);
        assert!(tree.set(3));
        assert_eq!(tree.select(), Some((3, true)));
    }

    #[test]
    fn test_randomized_set_order() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let n = 128;
        let tree = SignalTree::with_capacity(n);

        for _ in 0..20 {
            let mut slots: Vec<usize> = (0..n).collect();
            slots.shuffle(&mut rng);
            let picked = slots[..n / 2].to_vec();

            for &i in &picked {
                assert!(tree.set(i));
            }
            tree.check_sums();

            let mut claimed = HashSet::new();
            while let Some((slot, _)) = tree.select() {
                assert!(claimed.insert(slot));
            }
            assert_eq!(
                claimed,
                picked.iter().copied().collect::<HashSet<_>>(),
                "select must return exactly the set slots"
            );
            tree.check_sums();
        }
    }

    #[test]
    fn test_concurrent_set_select() {
        use std::sync::atomic::{AtomicUsize, Ordering as AO};
        use std::sync::Mutex;

        const N: usize = 256;
        const ROUNDS: usize = 50;

        let tree = SignalTree::with_capacity(N);
        for round in 0..ROUNDS {
            let claimed = Mutex::new(HashSet::new());
            let selected = AtomicUsize::new(0);

            std::thread::scope(|s| {
                // Setters mark every slot exactly once between quiescent
                // points; selectors race them.
                for chunk in 0..4 {
                    let tree = &tree;
                    s.spawn(move || {
                        for i in (chunk * N / 4)..((chunk + 1) * N / 4) {
                            assert!(tree.set(i));
                        }
                    });
                }
                for _ in 0..4 {
                    let tree = &tree;
                    let claimed = &claimed;
                    let selected = &selected;
                    s.spawn(move || {
                        while selected.load(AO::Acquire) < N {
                            if let Some((slot, _)) = tree.select() {
                                assert!(
                                    claimed.lock().unwrap().insert(slot),
                                    "slot {slot} claimed twice in round {round}"
                                );
                                selected.fetch_add(1, AO::AcqRel);
                            } else {
                                std::hint::spin_loop();
                            }
                        }
                    });
                }
            });

            assert_eq!(claimed.lock().unwrap().len(), N);
            assert!(tree.is_empty());
            tree.check_sums();
        }
    }
}
