//! Physical regions: contiguous spans of usable RAM carved into zones.
//!
//! A region is built in two phases. During boot it is a bare
//! `[lower, upper)` range that can still be split
//! ([`try_take_pages_from_beginning`](PhysicalRegion::try_take_pages_from_beginning));
//! once [`initialize_zones`](PhysicalRegion::initialize_zones) runs it is
//! wrapped in an `Arc` and only hands out and takes back frames.
//!
//! Zones live in an arena (`Vec<PhysicalZone>`) and are referenced by index
//! from two lists: `usable` (at least one free frame) and `full`. A zone
//! index moves between the lists exactly when its free count crosses zero.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_core::addr::PhysAddr;
use kestrel_core::sync::SpinLock;
use kestrel_core::{kdebug, kwarn};

use super::page::PhysicalPage;
use super::zone::{MAX_ZONE_FRAMES, MIN_ZONE_FRAMES, PhysicalZone};
use crate::PmmError;
use crate::hhdm::Hhdm;

/// Zone sizes used by [`PhysicalRegion::initialize_zones`].
pub const DEFAULT_ZONE_SIZES: [usize; 2] = [MAX_ZONE_FRAMES, MIN_ZONE_FRAMES];

struct ZoneLists {
    zones: Vec<PhysicalZone>,
    usable: Vec<usize>,
    full: Vec<usize>,
    free_count: usize,
}

impl ZoneLists {
    const fn empty() -> Self {
        Self {
            zones: Vec::new(),
            usable: Vec::new(),
            full: Vec::new(),
            free_count: 0,
        }
    }

    /// Moves `index` to the full list if its zone just filled up.
    fn note_allocated(&mut self, index: usize) {
        if !self.zones[index].is_full() {
            return;
        }
        if let Some(pos) = self.usable.iter().position(|&i| i == index) {
            self.usable.remove(pos);
            self.full.push(index);
        }
    }

    /// Zone owning `addr`, found by binary search over ascending bases.
    fn zone_index(&self, addr: PhysAddr) -> Option<usize> {
        let pos = self.zones.partition_point(|z| z.base() <= addr);
        let index = pos.checked_sub(1)?;
        self.zones[index].contains(addr).then_some(index)
    }
}

/// A contiguous span of usable physical memory.
pub struct PhysicalRegion {
    lower: PhysAddr,
    upper: PhysAddr,
    hhdm: Hhdm,
    zones: SpinLock<ZoneLists>,
}

impl PhysicalRegion {
    /// Creates a region covering `[lower, upper)`. Both bounds must be page
    /// aligned. The region has no zones yet and cannot allocate.
    pub fn new(lower: PhysAddr, upper: PhysAddr, hhdm: Hhdm) -> Self {
        debug_assert!(lower.is_page_aligned() && upper.is_page_aligned());
        debug_assert!(lower < upper, "empty physical region");
        Self {
            lower,
            upper,
            hhdm,
            zones: SpinLock::named("PhysicalRegion", ZoneLists::empty()),
        }
    }

    /// Lowest frame of the region.
    pub fn lower(&self) -> PhysAddr {
        self.lower
    }

    /// One past the highest frame of the region.
    pub fn upper(&self) -> PhysAddr {
        self.upper
    }

    /// Number of frames in `[lower, upper)`.
    pub fn size(&self) -> usize {
        self.upper.pages_from(self.lower)
    }

    /// Returns `true` if `addr` lies inside the region.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.lower && addr < self.upper
    }

    /// Number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.zones.lock().free_count
    }

    /// Number of zones carved out of the region.
    pub fn zone_count(&self) -> usize {
        self.zones.lock().zones.len()
    }

    /// Splits the first `count` frames off into a new region, for boot-time
    /// consumers that need memory before the allocator is up.
    ///
    /// Returns `None` once zones exist, or unless `0 < count < size()`.
    pub fn try_take_pages_from_beginning(&mut self, count: usize) -> Option<PhysicalRegion> {
        if !self.zones.get_mut().zones.is_empty() || count == 0 || count >= self.size() {
            return None;
        }
        let split = self.lower.offset_pages(count);
        let taken = PhysicalRegion::new(self.lower, split, self.hhdm);
        self.lower = split;
        Some(taken)
    }

    /// Carves zones using [`DEFAULT_ZONE_SIZES`].
    pub fn initialize_zones(&mut self) -> Result<(), PmmError> {
        self.initialize_zones_with(&DEFAULT_ZONE_SIZES)
    }

    /// Carves zones greedily from `lower`, trying each size of `sizes` (in
    /// order, largest first) until the remainder no longer fits. Frames that
    /// fit no zone are trimmed off `upper`.
    ///
    /// # Errors
    ///
    /// [`PmmError::ZonesInitialized`] if called twice,
    /// [`PmmError::InvalidRequest`] if the region cannot hold a single zone.
    pub fn initialize_zones_with(&mut self, sizes: &[usize]) -> Result<(), PmmError> {
        let lists = self.zones.get_mut();
        if !lists.zones.is_empty() {
            return Err(PmmError::ZonesInitialized);
        }

        let mut cursor = self.lower;
        let mut remaining = self.upper.pages_from(self.lower);
        for &frames in sizes {
            while remaining >= frames {
                lists.zones.push(PhysicalZone::new(cursor, frames));
                cursor = cursor.offset_pages(frames);
                remaining -= frames;
            }
        }
        if lists.zones.is_empty() {
            return Err(PmmError::InvalidRequest);
        }
        if remaining > 0 {
            kwarn!(
                "PhysicalRegion {}-{}: {} trailing frames fit no zone, trimmed",
                self.lower,
                self.upper,
                remaining
            );
            self.upper = cursor;
        }

        lists.usable = (0..lists.zones.len()).collect();
        lists.free_count = lists.zones.iter().map(PhysicalZone::free_count).sum();
        kdebug!(
            "PhysicalRegion {}-{}: {} zones, {} frames",
            self.lower,
            self.upper,
            lists.zones.len(),
            lists.free_count
        );
        Ok(())
    }

    /// Allocates one frame from the first usable zone.
    ///
    /// # Errors
    ///
    /// [`PmmError::CapacityExhausted`] when every zone is full.
    pub fn take_free_page(self: &Arc<Self>) -> Result<PhysicalPage, PmmError> {
        let addr = {
            let mut lists = self.zones.lock();
            let index = *lists.usable.first().ok_or(PmmError::CapacityExhausted)?;
            let addr = lists.zones[index]
                .allocate()
                .ok_or(PmmError::CapacityExhausted)?;
            lists.free_count -= 1;
            lists.note_allocated(index);
            addr
        };
        self.verify_poison(addr);
        Ok(PhysicalPage::new(addr, Arc::clone(self)))
    }

    /// Allocates `count` physically contiguous frames from a single zone.
    ///
    /// Never spans zones; callers needing more than one zone's worth must
    /// set aside a dedicated region at boot.
    ///
    /// # Errors
    ///
    /// [`PmmError::InvalidRequest`] for `count == 0`,
    /// [`PmmError::CapacityExhausted`] if no zone has a long enough run.
    pub fn take_contiguous_free_pages(
        self: &Arc<Self>,
        count: usize,
    ) -> Result<Vec<PhysicalPage>, PmmError> {
        if count == 0 {
            return Err(PmmError::InvalidRequest);
        }
        let base = {
            let mut lists = self.zones.lock();
            let mut found = None;
            for pos in 0..lists.usable.len() {
                let index = lists.usable[pos];
                if let Some(base) = lists.zones[index].allocate_contiguous(count) {
                    found = Some((index, base));
                    break;
                }
            }
            let (index, base) = found.ok_or(PmmError::CapacityExhausted)?;
            lists.free_count -= count;
            lists.note_allocated(index);
            base
        };
        Ok((0..count)
            .map(|i| {
                let addr = base.offset_pages(i);
                self.verify_poison(addr);
                PhysicalPage::new(addr, Arc::clone(self))
            })
            .collect())
    }

    /// Returns a frame to its zone. Called when the last
    /// [`PhysicalPage`] reference to it is dropped.
    ///
    /// # Errors
    ///
    /// [`PmmError::InvalidFrame`] if the frame is not an allocated frame of
    /// this region.
    pub fn return_page(&self, addr: PhysAddr) -> Result<(), PmmError> {
        let mut lists = self.zones.lock();
        let index = lists.zone_index(addr).ok_or(PmmError::InvalidFrame)?;
        let was_full = lists.zones[index].is_full();
        lists.zones[index].free(addr)?;
        // Still under the lock, so nobody can have taken the frame again.
        if cfg!(kestrel_debug_pmm_poison) {
            self.hhdm.poison_frame(addr);
        }
        lists.free_count += 1;
        if was_full {
            if let Some(pos) = lists.full.iter().position(|&i| i == index) {
                lists.full.swap_remove(pos);
                lists.usable.push(index);
            }
        }
        Ok(())
    }

    /// Checks that `free_count` equals the sum of the zones' free counts and
    /// that every zone sits on exactly the right list.
    pub fn check_accounting(&self) -> bool {
        let lists = self.zones.lock();
        let sum: usize = lists.zones.iter().map(PhysicalZone::free_count).sum();
        let lists_ok = lists.zones.iter().enumerate().all(|(i, z)| {
            let in_usable = lists.usable.contains(&i);
            let in_full = lists.full.contains(&i);
            in_usable != in_full && in_full == z.is_full()
        });
        sum == lists.free_count && lists_ok
    }

    fn verify_poison(&self, addr: PhysAddr) {
        // No logging here: the caller may hold locks the log sink needs.
        if cfg!(kestrel_debug_pmm_poison) && !self.hhdm.check_poison(addr) {
            panic!("PMM: frame {addr} modified after free (use-after-free)");
        }
    }
}

impl core::fmt::Debug for PhysicalRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalRegion")
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FrameBuffer;

    fn region(mem: &FrameBuffer, frames: usize, sizes: &[usize]) -> Arc<PhysicalRegion> {
        let mut region = PhysicalRegion::new(mem.frame(0), mem.frame(frames), mem.hhdm());
        region.initialize_zones_with(sizes).unwrap();
        Arc::new(region)
    }

    #[test]
    fn zones_cover_region_and_trim_tail() {
        let mem = FrameBuffer::new(4096 + 256 + 50);
        let mut region = PhysicalRegion::new(mem.frame(0), mem.frame(4096 + 256 + 50), mem.hhdm());
        region.initialize_zones().unwrap();
        assert_eq!(region.zone_count(), 3);
        assert_eq!(region.size(), 4096 + 256);
        assert_eq!(region.free_count(), 4096 + 256);
        assert_eq!(region.initialize_zones(), Err(PmmError::ZonesInitialized));
    }

    #[test]
    fn region_too_small_for_a_zone() {
        let mem = FrameBuffer::new(64);
        let mut region = PhysicalRegion::new(mem.frame(0), mem.frame(64), mem.hhdm());
        assert_eq!(region.initialize_zones(), Err(PmmError::InvalidRequest));
    }

    #[test]
    fn take_from_beginning_only_before_zones() {
        let mem = FrameBuffer::new(256 + 16);
        let mut region = PhysicalRegion::new(mem.frame(0), mem.frame(256 + 16), mem.hhdm());
        assert!(region.try_take_pages_from_beginning(0).is_none());
        assert!(region.try_take_pages_from_beginning(272).is_none());
        let boot = region.try_take_pages_from_beginning(16).unwrap();
        assert_eq!(boot.lower(), mem.frame(0));
        assert_eq!(boot.size(), 16);
        assert_eq!(region.lower(), mem.frame(16));
        region.initialize_zones().unwrap();
        assert!(region.try_take_pages_from_beginning(1).is_none());
    }

    #[test]
    fn zone_moves_between_lists() {
        let mem = FrameBuffer::new(256);
        let region = region(&mem, 256, &[128]);
        let pages: Vec<_> = (0..128).map(|_| region.take_free_page().unwrap()).collect();
        assert!(region.check_accounting());
        assert_eq!(region.zones.lock().full, vec![0]);

        let extra = region.take_free_page().unwrap();
        assert!(extra.paddr() >= mem.frame(128));

        drop(pages);
        assert!(region.check_accounting());
        assert!(region.zones.lock().full.is_empty());
        assert_eq!(region.free_count(), 255);
    }

    #[test]
    fn single_zone_exhaustion() {
        let mem = FrameBuffer::new(128);
        let region = region(&mem, 128, &[128]);
        let mut held: Vec<_> = (0..128).map(|_| region.take_free_page().unwrap()).collect();
        assert_eq!(region.take_free_page().unwrap_err(), PmmError::CapacityExhausted);
        assert_eq!(region.free_count(), 0);

        let victim = held.swap_remove(40).paddr();
        assert_eq!(region.free_count(), 1);
        assert_eq!(region.take_free_page().unwrap().paddr(), victim);
    }

    #[test]
    fn contiguous_never_spans_zones() {
        let mem = FrameBuffer::new(256);
        let region = region(&mem, 256, &[128]);
        assert_eq!(
            region.take_contiguous_free_pages(129).unwrap_err(),
            PmmError::CapacityExhausted
        );
        let run = region.take_contiguous_free_pages(16).unwrap();
        for (i, page) in run.iter().enumerate() {
            assert_eq!(page.paddr(), mem.frame(i));
        }
        assert_eq!(region.free_count(), 240);
        assert_eq!(region.take_contiguous_free_pages(0).unwrap_err(), PmmError::InvalidRequest);
    }

    #[test]
    fn return_page_rejects_foreign_frame() {
        let mem = FrameBuffer::new(128);
        let region = region(&mem, 128, &[128]);
        assert_eq!(region.return_page(mem.frame(500)), Err(PmmError::InvalidFrame));
    }

    #[test]
    fn rejected_frame_is_left_untouched() {
        // Frames past the last zone belong to the buffer but to no zone.
        let mem = FrameBuffer::new(128 + 16);
        let region = region(&mem, 128 + 16, &[128]);
        let stray = mem.frame(130);
        // SAFETY: The frame belongs to the test buffer.
        unsafe { mem.hhdm().write(stray, 0, b"not yours") };

        assert_eq!(region.return_page(stray), Err(PmmError::InvalidFrame));
        let mut buf = [0u8; 9];
        // SAFETY: As above.
        unsafe { mem.hhdm().read(stray, 0, &mut buf) };
        assert_eq!(&buf, b"not yours");
        assert_eq!(region.free_count(), 128);
        assert!(region.check_accounting());
    }
}
