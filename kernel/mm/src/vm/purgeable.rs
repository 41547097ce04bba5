//! Volatile page ranges for purgeable memory.
//!
//! Every region that maps a purgeable object registers one
//! [`VolatilePageRanges`] set with it. A page is effectively volatile only
//! if every registration covers it, so one mapping marking a page volatile
//! can never let the object throw away data another mapping still needs.

use alloc::vec::Vec;

/// A run of page indices (relative to the VM object) marked volatile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatilePageRange {
    /// First page index.
    pub base: usize,
    /// Number of pages (non-zero).
    pub count: usize,
    /// Whether any page of the run was purged since it became volatile.
    pub was_purged: bool,
}

impl VolatilePageRange {
    /// Creates a range that has not been purged.
    pub const fn new(base: usize, count: usize) -> Self {
        Self {
            base,
            count,
            was_purged: false,
        }
    }

    /// One past the last page index.
    pub const fn end(&self) -> usize {
        self.base + self.count
    }

    /// Returns `true` if `index` lies inside the range.
    pub const fn contains(&self, index: usize) -> bool {
        index >= self.base && index < self.end()
    }

    const fn touches(&self, base: usize, end: usize) -> bool {
        self.base <= end && base <= self.end()
    }

    const fn overlaps(&self, base: usize, end: usize) -> bool {
        self.base < end && base < self.end()
    }
}

/// Sorted, disjoint, non-adjacent set of volatile ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolatilePageRanges {
    ranges: Vec<VolatilePageRange>,
}

impl VolatilePageRanges {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// The ranges in ascending order.
    pub fn ranges(&self) -> &[VolatilePageRange] {
        &self.ranges
    }

    /// Returns `true` if nothing is volatile.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns `true` if `index` is marked volatile.
    pub fn contains(&self, index: usize) -> bool {
        let pos = self.ranges.partition_point(|r| r.end() <= index);
        self.ranges.get(pos).is_some_and(|r| r.contains(index))
    }

    /// Marks `[base, base + count)` volatile, merging with overlapping and
    /// adjacent ranges. A merged range inherits `was_purged` from any part.
    ///
    /// Returns `true` if the set changed.
    pub fn add(&mut self, base: usize, count: usize) -> bool {
        if count == 0 {
            return false;
        }
        let mut merged = VolatilePageRange::new(base, count);
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        let mut changed = true;
        for range in self.ranges.drain(..) {
            if range.touches(merged.base, merged.end()) {
                if range.base <= base && range.end() >= base + count {
                    changed = false;
                }
                let end = merged.end().max(range.end());
                merged.base = merged.base.min(range.base);
                merged.count = end - merged.base;
                merged.was_purged |= range.was_purged;
            } else {
                kept.push(range);
            }
        }
        let pos = kept.partition_point(|r| r.base < merged.base);
        kept.insert(pos, merged);
        self.ranges = kept;
        changed
    }

    /// Clears `[base, base + count)`, splitting ranges as needed.
    ///
    /// Returns `(changed, was_purged)`, where `was_purged` reports whether
    /// any removed range had been purged.
    pub fn remove(&mut self, base: usize, count: usize) -> (bool, bool) {
        let end = base + count;
        let mut changed = false;
        let mut was_purged = false;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if count == 0 || !range.overlaps(base, end) {
                kept.push(range);
                continue;
            }
            changed = true;
            was_purged |= range.was_purged;
            if range.base < base {
                kept.push(VolatilePageRange {
                    base: range.base,
                    count: base - range.base,
                    was_purged: range.was_purged,
                });
            }
            if range.end() > end {
                kept.push(VolatilePageRange {
                    base: end,
                    count: range.end() - end,
                    was_purged: range.was_purged,
                });
            }
        }
        self.ranges = kept;
        (changed, was_purged)
    }

    /// Flags the range containing `index` as purged.
    pub fn mark_purged(&mut self, index: usize) {
        if let Some(range) = self.ranges.iter_mut().find(|r| r.contains(index)) {
            range.was_purged = true;
        }
    }

    /// Iterates over every volatile page index.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|r| r.base..r.end())
    }
}
