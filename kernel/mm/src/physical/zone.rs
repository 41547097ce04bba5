//! Power-of-two sized frame zones.
//!
//! A zone tracks a contiguous run of frames with one bit per frame
//! (1 = allocated). Zones never lock on their own: the owning
//! [`PhysicalRegion`](super::PhysicalRegion) serialises access.

use kestrel_core::addr::PhysAddr;

use crate::bitmap::Bitmap;
use crate::{PAGE_SIZE, PmmError};

/// Smallest zone size in frames.
pub const MIN_ZONE_FRAMES: usize = 128;
/// Largest zone size in frames.
pub const MAX_ZONE_FRAMES: usize = 4096;

/// A contiguous, power-of-two sized run of physical frames.
#[derive(Debug)]
pub struct PhysicalZone {
    base: PhysAddr,
    bitmap: Bitmap,
    free_count: usize,
    /// No free frame exists below this index.
    hint: usize,
}

impl PhysicalZone {
    /// Creates a zone of `frame_count` free frames starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `frame_count` is not a power of two between
    /// [`MIN_ZONE_FRAMES`] and [`MAX_ZONE_FRAMES`], or `base` is unaligned.
    pub fn new(base: PhysAddr, frame_count: usize) -> Self {
        assert!(
            frame_count.is_power_of_two()
                && (MIN_ZONE_FRAMES..=MAX_ZONE_FRAMES).contains(&frame_count),
            "invalid zone size {frame_count}"
        );
        assert!(base.is_page_aligned(), "zone base {base} is not page aligned");
        Self {
            base,
            bitmap: Bitmap::new(frame_count),
            free_count: frame_count,
            hint: 0,
        }
    }

    /// First frame of the zone.
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// One past the last frame of the zone.
    pub fn end(&self) -> PhysAddr {
        self.base.offset_pages(self.frame_count())
    }

    /// Number of frames covered.
    pub fn frame_count(&self) -> usize {
        self.bitmap.len()
    }

    /// Number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Returns `true` once every frame is allocated.
    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    /// Returns `true` if `addr` lies inside the zone.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Allocates one frame, scanning forward from the hint.
    pub fn allocate(&mut self) -> Option<PhysAddr> {
        if self.free_count == 0 {
            return None;
        }
        let index = self.bitmap.first_clear_from(self.hint)?;
        self.bitmap.set(index);
        self.free_count -= 1;
        self.hint = index + 1;
        Some(self.base.offset_pages(index))
    }

    /// Allocates `count` consecutive frames and returns the first.
    ///
    /// A plain linear scan; there is no compaction.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 || count > self.free_count {
            return None;
        }
        let start = self.bitmap.find_clear_run(count)?;
        self.bitmap.set_range(start, count);
        self.free_count -= count;
        if (start..start + count).contains(&self.hint) {
            self.hint = start + count;
        }
        Some(self.base.offset_pages(start))
    }

    /// Returns one frame to the zone.
    ///
    /// # Errors
    ///
    /// [`PmmError::InvalidFrame`] if `addr` is outside the zone, unaligned,
    /// or not currently allocated.
    pub fn free(&mut self, addr: PhysAddr) -> Result<(), PmmError> {
        if !self.contains(addr) || !addr.is_page_aligned() {
            return Err(PmmError::InvalidFrame);
        }
        let index = addr.pages_from(self.base);
        debug_assert!(self.bitmap.get(index), "double free of frame {addr}");
        if !self.bitmap.get(index) {
            return Err(PmmError::InvalidFrame);
        }
        self.bitmap.clear(index);
        self.free_count += 1;
        if index < self.hint {
            self.hint = index;
        }
        Ok(())
    }

    /// Size of the zone in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.frame_count() * PAGE_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(frames: usize) -> PhysicalZone {
        PhysicalZone::new(PhysAddr::new(0x10_0000), frames)
    }

    #[test]
    fn allocates_sequentially() {
        let mut z = zone(128);
        assert_eq!(z.allocate(), Some(PhysAddr::new(0x10_0000)));
        assert_eq!(z.allocate(), Some(PhysAddr::new(0x10_1000)));
        assert_eq!(z.free_count(), 126);
    }

    #[test]
    fn exhaustion_returns_none_without_touching_state() {
        let mut z = zone(128);
        for _ in 0..128 {
            assert!(z.allocate().is_some());
        }
        assert!(z.is_full());
        assert_eq!(z.allocate(), None);
        assert_eq!(z.free_count(), 0);

        // Freeing any frame makes exactly that frame available again.
        let victim = PhysAddr::new(0x10_0000).offset_pages(77);
        z.free(victim).unwrap();
        assert_eq!(z.allocate(), Some(victim));
        assert_eq!(z.allocate(), None);
    }

    #[test]
    fn free_rewinds_hint() {
        let mut z = zone(128);
        let a = z.allocate().unwrap();
        let _b = z.allocate().unwrap();
        z.free(a).unwrap();
        assert_eq!(z.allocate(), Some(a));
    }

    #[test]
    fn free_rejects_foreign_and_unallocated_frames() {
        let mut z = zone(128);
        assert_eq!(z.free(PhysAddr::new(0x20_0000)), Err(PmmError::InvalidFrame));
        assert_eq!(z.free(PhysAddr::new(0x10_0800)), Err(PmmError::InvalidFrame));
    }

    #[test]
    fn contiguous_skips_holes() {
        let mut z = zone(128);
        let first = z.allocate().unwrap();
        let _second = z.allocate().unwrap();
        z.free(first).unwrap();
        // Frame 0 is free, frame 1 is used: a run of 4 must start at 2.
        let run = z.allocate_contiguous(4).unwrap();
        assert_eq!(run, PhysAddr::new(0x10_2000));
        assert_eq!(z.free_count(), 128 - 5);
        // The hole at frame 0 still serves single allocations.
        assert_eq!(z.allocate(), Some(first));
    }

    #[test]
    fn contiguous_larger_than_free_fails() {
        let mut z = zone(128);
        assert_eq!(z.allocate_contiguous(129), None);
        assert!(z.allocate_contiguous(128).is_some());
        assert!(z.is_full());
    }

    #[test]
    #[should_panic(expected = "invalid zone size")]
    fn rejects_non_power_of_two() {
        let _ = zone(100);
    }
}
