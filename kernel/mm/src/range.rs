//! Virtual range allocator for user address spaces.
//!
//! [`VirtualRangeAllocator`] hands out page-aligned ranges from
//! `[base, end)` with a bump watermark and a sorted, coalescing free list.
//! Fixed-address requests carve their range out of the free space with
//! [`allocate_specific`](VirtualRangeAllocator::allocate_specific).

use core::fmt;

use planck_noalloc::vec::ArrayVec;

use kestrel_core::PAGE_SIZE;
use kestrel_core::addr::VirtAddr;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

#[inline]
fn page_align_up(size: u64) -> u64 {
    (size + PAGE_MASK) & !PAGE_MASK
}

/// Errors from the [`VirtualRangeAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The requested range is outside the allocator or already in use.
    Unavailable,
    /// The free list is at capacity and the range could not be coalesced
    /// with an existing entry.
    FreeListFull,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "virtual range unavailable"),
            Self::FreeListFull => write!(f, "virtual range free list full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    base: u64,
    size: u64,
}

impl FreeRange {
    const fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// A first-fit virtual range allocator.
///
/// Everything at or above the watermark is free. Holes below it live in
/// `free_list`, sorted by base and always coalesced; no entry ever ends at
/// the watermark.
#[derive(Debug)]
pub struct VirtualRangeAllocator<const N: usize> {
    base: u64,
    end: u64,
    free_list: ArrayVec<FreeRange, N>,
    watermark: u64,
}

impl<const N: usize> VirtualRangeAllocator<N> {
    /// Creates an allocator covering `[base, end)`.
    pub fn new(base: VirtAddr, end: VirtAddr) -> Self {
        debug_assert!(base.is_page_aligned() && end.is_page_aligned() && base <= end);
        Self {
            base: base.as_u64(),
            end: end.as_u64(),
            free_list: ArrayVec::new(),
            watermark: base.as_u64(),
        }
    }

    /// Lowest address managed.
    pub fn base(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.base)
    }

    /// One past the highest address managed.
    pub fn end(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.end)
    }

    /// Allocates `size` bytes (rounded up to pages), first fit.
    ///
    /// Returns `None` for a zero size or if no free range is large enough.
    pub fn allocate(&mut self, size: u64) -> Option<VirtAddr> {
        let size = page_align_up(size);
        if size == 0 {
            return None;
        }

        if let Some(i) = self.free_list.iter().position(|r| r.size >= size) {
            let entry = self.free_list[i];
            if entry.size == size {
                self.free_list.remove(i);
            } else {
                self.free_list[i] = FreeRange {
                    base: entry.base + size,
                    size: entry.size - size,
                };
            }
            return Some(VirtAddr::new_truncate(entry.base));
        }

        let end = self.watermark.checked_add(size)?;
        if end > self.end {
            return None;
        }
        let base = self.watermark;
        self.watermark = end;
        Some(VirtAddr::new_truncate(base))
    }

    /// Allocates exactly `[addr, addr + size)`.
    ///
    /// # Errors
    ///
    /// [`RangeError::Unavailable`] if any part of the range is outside the
    /// allocator or already allocated, [`RangeError::FreeListFull`] if
    /// splitting a free range needs an extra entry that does not fit.
    pub fn allocate_specific(&mut self, addr: VirtAddr, size: u64) -> Result<(), RangeError> {
        let base = addr.as_u64();
        let size = page_align_up(size);
        let end = base.checked_add(size).ok_or(RangeError::Unavailable)?;
        if size == 0 || !addr.is_page_aligned() || base < self.base || end > self.end {
            return Err(RangeError::Unavailable);
        }

        if base >= self.watermark {
            if base > self.watermark {
                // The skipped gap becomes a hole below the new watermark.
                if self.free_list.is_full() {
                    return Err(RangeError::FreeListFull);
                }
                self.free_list.push(FreeRange {
                    base: self.watermark,
                    size: base - self.watermark,
                });
            }
            self.watermark = end;
            return Ok(());
        }

        let Some(i) = self
            .free_list
            .iter()
            .position(|r| r.base <= base && end <= r.end())
        else {
            return Err(RangeError::Unavailable);
        };
        let entry = self.free_list[i];
        let before = FreeRange {
            base: entry.base,
            size: base - entry.base,
        };
        let after = FreeRange {
            base: end,
            size: entry.end() - end,
        };
        match (before.size > 0, after.size > 0) {
            (false, false) => {
                self.free_list.remove(i);
            }
            (true, false) => self.free_list[i] = before,
            (false, true) => self.free_list[i] = after,
            (true, true) => {
                if self.free_list.is_full() {
                    return Err(RangeError::FreeListFull);
                }
                self.free_list[i] = before;
                self.free_list.insert(i + 1, after);
            }
        }
        Ok(())
    }

    /// Returns `[addr, addr + size)` to the allocator.
    ///
    /// # Errors
    ///
    /// [`RangeError::FreeListFull`] if the range is not adjacent to any free
    /// range and the free list is at capacity.
    ///
    /// # Panics
    ///
    /// Debug-panics on ranges outside the allocated space or overlapping a
    /// free range (double free).
    pub fn deallocate(&mut self, addr: VirtAddr, size: u64) -> Result<(), RangeError> {
        let base = addr.as_u64();
        let size = page_align_up(size);
        if size == 0 {
            return Ok(());
        }
        let end = base + size;
        debug_assert!(base >= self.base && end <= self.watermark, "deallocate: range never allocated");

        if end == self.watermark {
            self.watermark = base;
            self.retract_watermark();
            return Ok(());
        }

        let idx = self.free_list.as_slice().partition_point(|r| r.base < base);
        debug_assert!(
            idx == 0 || self.free_list[idx - 1].end() <= base,
            "deallocate: overlaps predecessor (double free?)"
        );
        debug_assert!(
            idx >= self.free_list.len() || self.free_list[idx].base >= end,
            "deallocate: overlaps successor (double free?)"
        );

        let merge_prev = idx > 0 && self.free_list[idx - 1].end() == base;
        let merge_next = idx < self.free_list.len() && self.free_list[idx].base == end;
        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.free_list.remove(idx);
                self.free_list[idx - 1].size += size + next.size;
            }
            (true, false) => self.free_list[idx - 1].size += size,
            (false, true) => {
                self.free_list[idx].base = base;
                self.free_list[idx].size += size;
            }
            (false, false) => {
                if self.free_list.is_full() {
                    return Err(RangeError::FreeListFull);
                }
                self.free_list.insert(idx, FreeRange { base, size });
            }
        }
        Ok(())
    }

    /// Current watermark.
    pub fn watermark(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.watermark)
    }

    /// Number of holes below the watermark.
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    /// Bytes not allocated, holes and the space above the watermark.
    pub fn free_bytes(&self) -> u64 {
        self.free_list.iter().map(|r| r.size).sum::<u64>() + (self.end - self.watermark)
    }

    fn retract_watermark(&mut self) {
        while let Some(last) = self.free_list.last() {
            if last.end() != self.watermark {
                break;
            }
            self.watermark = last.base;
            let _ = self.free_list.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE as u64;

    fn alloc<const N: usize>(pages: u64) -> VirtualRangeAllocator<N> {
        VirtualRangeAllocator::new(VirtAddr::new(0x40_0000), VirtAddr::new(0x40_0000 + pages * P))
    }

    #[test]
    fn bump_then_exhaust() {
        let mut ranges = alloc::<8>(4);
        assert_eq!(ranges.allocate(1).unwrap().as_u64(), 0x40_0000);
        assert_eq!(ranges.allocate(2 * P).unwrap().as_u64(), 0x40_1000);
        assert!(ranges.allocate(2 * P).is_none());
        assert!(ranges.allocate(0).is_none());
        assert_eq!(ranges.free_bytes(), P);
    }

    #[test]
    fn free_coalesces_and_retracts() {
        let mut ranges = alloc::<8>(16);
        let a = ranges.allocate(P).unwrap();
        let b = ranges.allocate(P).unwrap();
        let c = ranges.allocate(P).unwrap();
        let _d = ranges.allocate(P).unwrap();

        ranges.deallocate(a, P).unwrap();
        ranges.deallocate(c, P).unwrap();
        assert_eq!(ranges.free_list_len(), 2);
        ranges.deallocate(b, P).unwrap();
        assert_eq!(ranges.free_list_len(), 1);

        // First fit reuses the merged hole.
        assert_eq!(ranges.allocate(3 * P), Some(a));
        assert_eq!(ranges.free_list_len(), 0);
    }

    #[test]
    fn retraction_chains_through_holes() {
        let mut ranges = alloc::<8>(16);
        let a = ranges.allocate(P).unwrap();
        let b = ranges.allocate(P).unwrap();
        let c = ranges.allocate(P).unwrap();
        ranges.deallocate(b, P).unwrap();
        ranges.deallocate(c, P).unwrap();
        assert_eq!(ranges.watermark(), b);
        assert_eq!(ranges.free_list_len(), 0);
        ranges.deallocate(a, P).unwrap();
        assert_eq!(ranges.watermark(), a);
    }

    #[test]
    fn specific_above_watermark_leaves_hole() {
        let mut ranges = alloc::<8>(16);
        let fixed = VirtAddr::new(0x40_0000 + 4 * P);
        ranges.allocate_specific(fixed, 2 * P).unwrap();
        assert_eq!(ranges.watermark(), VirtAddr::new(0x40_0000 + 6 * P));
        assert_eq!(ranges.free_list_len(), 1);
        assert_eq!(
            ranges.allocate_specific(fixed + P, P),
            Err(RangeError::Unavailable)
        );
        // Anywhere allocations fill the hole first.
        assert_eq!(ranges.allocate(4 * P).unwrap().as_u64(), 0x40_0000);
    }

    #[test]
    fn specific_splits_hole() {
        let mut ranges = alloc::<8>(16);
        let a = ranges.allocate(8 * P).unwrap();
        let _guard = ranges.allocate(P).unwrap();
        ranges.deallocate(a, 8 * P).unwrap();

        ranges.allocate_specific(a + 2 * P, 2 * P).unwrap();
        assert_eq!(ranges.free_list_len(), 2);
        assert_eq!(ranges.allocate(2 * P), Some(a));
        assert_eq!(ranges.allocate(4 * P), Some(a + 4 * P));
    }

    #[test]
    fn specific_rejects_out_of_bounds() {
        let mut ranges = alloc::<8>(4);
        assert_eq!(
            ranges.allocate_specific(VirtAddr::new(0x3F_F000), P),
            Err(RangeError::Unavailable)
        );
        assert_eq!(
            ranges.allocate_specific(VirtAddr::new(0x40_3000), 2 * P),
            Err(RangeError::Unavailable)
        );
        assert_eq!(
            ranges.allocate_specific(VirtAddr::new(0x40_0800), P),
            Err(RangeError::Unavailable)
        );
    }

    #[test]
    fn free_list_full() {
        let mut ranges = alloc::<2>(16);
        let a = ranges.allocate(P).unwrap();
        let _b = ranges.allocate(P).unwrap();
        let c = ranges.allocate(P).unwrap();
        let _d = ranges.allocate(P).unwrap();
        let e = ranges.allocate(P).unwrap();
        let _f = ranges.allocate(P).unwrap();
        ranges.deallocate(a, P).unwrap();
        ranges.deallocate(c, P).unwrap();
        assert_eq!(ranges.deallocate(e, P), Err(RangeError::FreeListFull));
    }
}
