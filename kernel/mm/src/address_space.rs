//! User address spaces.
//!
//! An [`AddressSpace`] is a page table plus the [`Region`]s mapped into it
//! and the allocator for its free virtual ranges. One lock covers all
//! three, which serialises every page-table edit for the space. The lock
//! is taken before any VM object lock and never together with another
//! address space's lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use kestrel_core::PAGE_SIZE;
use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::sync::SpinLock;
use kestrel_core::{kdebug, kwarn};

use crate::VmError;
use crate::fault::{PageFault, Resolution};
use crate::mapper::{MapFlags, PageTable};
use crate::pmm::Pmm;
use crate::range::VirtualRangeAllocator;
use crate::region::{Access, Region};
use crate::vm::{VmObject, VolatilePageRanges};

/// Capacity of the per-space free range list.
pub const MAX_FREE_RANGES: usize = 64;

/// Identifies an address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    /// Wraps a raw id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS#{}", self.0)
    }
}

/// Names a region: its address space and base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionRef {
    /// Owning address space.
    pub space: AddressSpaceId,
    /// Base address of the region.
    pub base: VirtAddr,
}

/// Where a new region goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// First free range large enough.
    Anywhere,
    /// Exactly at this page-aligned address.
    Fixed(VirtAddr),
}

/// Parameters of a new region.
#[derive(Debug, Clone)]
pub struct RegionSpec {
    /// Object to map.
    pub object: Arc<VmObject>,
    /// First object page mapped.
    pub offset_in_object: usize,
    /// Length in pages.
    pub page_count: usize,
    /// Virtual placement.
    pub placement: Placement,
    /// Permission mask.
    pub access: Access,
    /// Keep the object (rather than a COW clone) across fork.
    pub shared: bool,
    /// Register volatile ranges with the object.
    pub purgeable: bool,
    /// Map with caching enabled. Device memory usually wants `false`.
    pub cacheable: bool,
    /// Map without user-mode access.
    pub kernel_only: bool,
    /// Debug name.
    pub name: &'static str,
}

/// Snapshot of a region's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Handle of the region.
    pub reference: RegionRef,
    /// Length in pages.
    pub page_count: usize,
    /// Permission mask.
    pub access: Access,
    /// Shared across fork.
    pub shared: bool,
    /// Has volatile ranges.
    pub purgeable: bool,
    /// Mapped with caching enabled.
    pub cacheable: bool,
    /// Not reachable from user mode.
    pub kernel_only: bool,
    /// Backed pages.
    pub resident: usize,
    /// Resident pages with no backing store to write them to.
    pub dirty: usize,
    /// Installed translations.
    pub mapped: usize,
    /// Debug name.
    pub name: &'static str,
}

impl RegionInfo {
    fn of(region: &Region) -> Self {
        Self {
            reference: region.reference(),
            page_count: region.page_count(),
            access: region.access(),
            shared: region.is_shared(),
            purgeable: region.is_purgeable(),
            cacheable: region.is_cacheable(),
            kernel_only: region.is_kernel_only(),
            resident: region.amount_resident(),
            dirty: region.amount_dirty(),
            mapped: region.amount_mapped(),
            name: region.name(),
        }
    }
}

struct AddressSpaceInner {
    table: Box<dyn PageTable>,
    /// Keyed by base address.
    regions: BTreeMap<VirtAddr, Region>,
    ranges: VirtualRangeAllocator<MAX_FREE_RANGES>,
}

impl AddressSpaceInner {
    fn region_containing(&mut self, addr: VirtAddr) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Region containing `[addr, addr + count pages)` and the page index of
    /// `addr` in it.
    fn region_span(&mut self, addr: VirtAddr, count: usize) -> Result<(&mut Region, usize), VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::InvalidRange);
        }
        let region = self.region_containing(addr).ok_or(VmError::NoSuchRegion)?;
        let first = region.page_index(addr);
        Ok((region, first))
    }

    fn detach_all(&mut self) {
        for (_, region) in core::mem::take(&mut self.regions) {
            region.detach(self.table.as_mut());
        }
        self.ranges = VirtualRangeAllocator::new(self.ranges.base(), self.ranges.end());
    }
}

/// A user address space.
pub struct AddressSpace {
    id: AddressSpaceId,
    inner: SpinLock<AddressSpaceInner>,
}

impl AddressSpace {
    /// Creates an empty address space handing out `[user_base, user_end)`.
    pub fn new(
        id: AddressSpaceId,
        table: Box<dyn PageTable>,
        user_base: VirtAddr,
        user_end: VirtAddr,
    ) -> Self {
        Self::from_inner(
            id,
            AddressSpaceInner {
                table,
                regions: BTreeMap::new(),
                ranges: VirtualRangeAllocator::new(user_base, user_end),
            },
        )
    }

    fn from_inner(id: AddressSpaceId, inner: AddressSpaceInner) -> Self {
        Self {
            id,
            inner: SpinLock::named("AddressSpace", inner),
        }
    }

    /// This space's id.
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Maps a region and installs translations for the pages the object
    /// already backs.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidRange`] for empty or unavailable ranges,
    /// [`VmError::OutOfBoundsAccess`] if the window leaves the object,
    /// [`VmError::NotPurgeable`] for purgeable requests on objects that are
    /// not, [`VmError::CapacityExhausted`] if no virtual range is free,
    /// [`VmError::MapFailed`] if the page table refuses an entry.
    pub fn map_region(&self, spec: RegionSpec) -> Result<RegionRef, VmError> {
        if spec.page_count == 0 {
            return Err(VmError::InvalidRange);
        }
        if spec.purgeable && !spec.object.is_purgeable() {
            return Err(VmError::NotPurgeable);
        }
        let size = (spec.page_count * PAGE_SIZE) as u64;
        let mut inner = self.inner.lock();
        let base = match spec.placement {
            Placement::Anywhere => inner.ranges.allocate(size).ok_or(VmError::CapacityExhausted)?,
            Placement::Fixed(base) => {
                inner
                    .ranges
                    .allocate_specific(base, size)
                    .map_err(|_| VmError::InvalidRange)?;
                base
            }
        };

        let attached = Region::attach(
            self.id,
            base,
            spec.page_count,
            spec.offset_in_object,
            spec.access,
            spec.shared,
            spec.purgeable.then(VolatilePageRanges::new),
            spec.name,
            spec.object,
        );
        let mut region = match attached {
            Ok(region) => region,
            Err(err) => {
                let _ = inner.ranges.deallocate(base, size);
                return Err(err);
            }
        };
        region.set_cacheable(spec.cacheable);
        region.set_kernel_only(spec.kernel_only);
        let AddressSpaceInner { table, regions, ranges } = &mut *inner;
        if let Err(err) = region.remap_all(table.as_mut()) {
            region.detach(table.as_mut());
            let _ = ranges.deallocate(base, size);
            return Err(err);
        }
        kdebug!(
            "{:?}: mapped '{}' at {}..{} ({:?})",
            self.id,
            region.name(),
            base,
            region.end(),
            region.access()
        );
        let reference = region.reference();
        regions.insert(base, region);
        Ok(reference)
    }

    /// Tears down the region based at `base`.
    pub fn unmap_region(&self, base: VirtAddr) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let region = inner.regions.remove(&base).ok_or(VmError::NoSuchRegion)?;
        if inner.ranges.deallocate(base, region.size()).is_err() {
            kwarn!("{:?}: free range list full, leaking {}..{}", self.id, base, region.end());
        }
        kdebug!("{:?}: unmapped '{}' at {}", self.id, region.name(), base);
        region.detach(inner.table.as_mut());
        Ok(())
    }

    /// Attributes of the region containing `addr`.
    pub fn find_region(&self, addr: VirtAddr) -> Option<RegionInfo> {
        self.inner.lock().region_containing(addr).map(|r| RegionInfo::of(r))
    }

    /// The object mapped by the region based at `base`.
    pub fn region_object(&self, base: VirtAddr) -> Option<Arc<VmObject>> {
        self.inner.lock().regions.get(&base).map(|r| Arc::clone(r.object()))
    }

    /// Attributes of every region, in address order.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.inner.lock().regions.values().map(RegionInfo::of).collect()
    }

    /// Resolves a fault. Returns the resolution and the object it touched.
    pub fn handle_fault(
        &self,
        pmm: &Pmm,
        fault: &PageFault,
    ) -> Result<(Resolution, Arc<VmObject>), VmError> {
        let mut inner = self.inner.lock();
        let AddressSpaceInner { table, regions, .. } = &mut *inner;
        let region = regions
            .range_mut(..=fault.address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(fault.address))
            .ok_or(VmError::NoSuchRegion)?;
        let resolution = region.handle_fault(pmm, table.as_mut(), fault)?;
        Ok((resolution, Arc::clone(region.object())))
    }

    /// Marks `count` pages from `addr` volatile.
    pub fn set_volatile(&self, addr: VirtAddr, count: usize) -> Result<(), VmError> {
        let mut inner = self.inner.lock();
        let (region, first) = inner.region_span(addr, count)?;
        region.set_volatile(first, count)
    }

    /// Marks `count` pages from `addr` non-volatile; `true` if any was
    /// purged meanwhile.
    pub fn set_nonvolatile(&self, addr: VirtAddr, count: usize) -> Result<bool, VmError> {
        let mut inner = self.inner.lock();
        let (region, first) = inner.region_span(addr, count)?;
        region.set_nonvolatile(first, count)
    }

    /// Lets purged pages of `count` pages from `addr` zero-fill again.
    pub fn repopulate(&self, addr: VirtAddr, count: usize) -> Result<usize, VmError> {
        let mut inner = self.inner.lock();
        let (region, first) = inner.region_span(addr, count)?;
        region.repopulate(first, count)
    }

    /// Refreshes the translations of object pages `indices` in the region
    /// based at `base`, if it still maps `object`.
    pub(crate) fn remap_object_pages(
        &self,
        object: &Arc<VmObject>,
        base: VirtAddr,
        indices: impl IntoIterator<Item = usize>,
    ) {
        let mut inner = self.inner.lock();
        let AddressSpaceInner { table, regions, .. } = &mut *inner;
        let Some(region) = regions.get_mut(&base) else {
            return;
        };
        if !Arc::ptr_eq(region.object(), object) {
            return;
        }
        for index in indices {
            if let Err(err) = region.remap_object_page(table.as_mut(), index) {
                kwarn!("{:?}: remap of '{}' page {} failed: {}", self.id, region.name(), index, err);
            }
        }
    }

    /// Builds the child of a fork.
    ///
    /// Private regions get clones of their objects (one clone per object,
    /// however many regions map it); shared regions keep the same object.
    /// A clone shares its frames copy-on-write unless another space maps
    /// the object too, in which case it gets copies. Every region of both
    /// spaces, shared ones included, ends up mapping COW pages read-only
    /// before the parent lock is dropped. The child is fully built before
    /// it is returned.
    ///
    /// # Errors
    ///
    /// [`VmError::CapacityExhausted`] if a clone's commitment cannot be
    /// met, [`VmError::MapFailed`] from the page tables. The parent keeps
    /// working either way.
    pub fn try_clone_for_fork(
        &self,
        child_id: AddressSpaceId,
        pmm: &Arc<Pmm>,
        table: Box<dyn PageTable>,
    ) -> Result<AddressSpace, VmError> {
        let mut inner = self.inner.lock();
        let mut child = Self::new(child_id, table, inner.ranges.base(), inner.ranges.end());
        let mut clones: Vec<(*const VmObject, Arc<VmObject>)> = Vec::new();

        // On error `child` is dropped, which detaches whatever was built.
        let child_inner = child.inner.get_mut();
        for region in inner.regions.values() {
            let object = if region.is_shared() {
                Arc::clone(region.object())
            } else {
                let key = Arc::as_ptr(region.object());
                match clones.iter().find(|(ptr, _)| *ptr == key) {
                    Some((_, clone)) => Arc::clone(clone),
                    None => {
                        let clone = Arc::new(region.object().try_clone_for_fork(pmm, self.id)?);
                        clones.push((key, Arc::clone(&clone)));
                        clone
                    }
                }
            };
            child_inner
                .ranges
                .allocate_specific(region.base(), region.size())
                .map_err(|_| VmError::InvalidRange)?;
            let forked = region.fork_into(child_id, object)?;
            child_inner.regions.insert(region.base(), forked);
        }

        // A shared region over a cloned object must lose write access to
        // the frames the clone now shares, like the private ones.
        let AddressSpaceInner { table, regions, .. } = &mut *inner;
        for region in regions.values_mut() {
            region.remap_all(table.as_mut())?;
        }
        drop(inner);

        let AddressSpaceInner { table, regions, .. } = child_inner;
        for region in regions.values_mut() {
            region.remap_all(table.as_mut())?;
        }
        kdebug!(
            "{:?}: forked into {:?} ({} regions, {} objects cloned)",
            self.id,
            child_id,
            regions.len(),
            clones.len()
        );
        Ok(child)
    }

    /// Unmaps and detaches every region.
    pub fn teardown(&self) {
        self.inner.lock().detach_all();
    }

    /// Physical address `addr` translates to.
    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.translation(addr).map(|(paddr, _)| paddr)
    }

    /// Physical address `addr` translates to and the flags of its page.
    pub fn translation(&self, addr: VirtAddr) -> Option<(PhysAddr, MapFlags)> {
        let inner = self.inner.lock();
        let (frame, flags) = inner.table.translate(addr)?;
        Some((frame + addr.page_offset(), flags))
    }

    /// Number of regions.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Backed pages over all regions.
    pub fn resident_pages(&self) -> usize {
        self.inner
            .lock()
            .regions
            .values()
            .map(Region::amount_resident)
            .sum()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.inner.get_mut().detach_all();
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_USER_BASE;
    use crate::fault::{FaultAccess, ResolutionKind};
    use crate::test_support::{SoftPageTable, TestMemory};
    use crate::vm::{AllocationStrategy, AnonymousVmObject};

    fn space(id: u64) -> AddressSpace {
        AddressSpace::new(
            AddressSpaceId::from_raw(id),
            Box::new(SoftPageTable::new()),
            VirtAddr::new(DEFAULT_USER_BASE),
            VirtAddr::new(DEFAULT_USER_BASE + 0x100_0000),
        )
    }

    fn anon(mem: &TestMemory, pages: usize, strategy: AllocationStrategy) -> Arc<VmObject> {
        Arc::new(VmObject::Anonymous(
            AnonymousVmObject::try_create(&mem.pmm(), pages, strategy, false).unwrap(),
        ))
    }

    fn spec(object: &Arc<VmObject>, placement: Placement) -> RegionSpec {
        RegionSpec {
            object: Arc::clone(object),
            offset_in_object: 0,
            page_count: object.page_count(),
            placement,
            access: Access::RW,
            shared: false,
            purgeable: false,
            cacheable: true,
            kernel_only: false,
            name: "anon",
        }
    }

    fn write_fault(addr: VirtAddr, present: bool) -> PageFault {
        PageFault {
            address: addr,
            access: FaultAccess::Write,
            present,
        }
    }

    #[test]
    fn map_places_and_finds_regions() {
        let mem = TestMemory::new(128);
        let space = space(1);
        let a = space.map_region(spec(&anon(&mem, 4, AllocationStrategy::None), Placement::Anywhere)).unwrap();
        let b = space.map_region(spec(&anon(&mem, 2, AllocationStrategy::None), Placement::Anywhere)).unwrap();
        assert_eq!(a.base, VirtAddr::new(DEFAULT_USER_BASE));
        assert_eq!(b.base, a.base.offset_pages(4));

        let info = space.find_region(b.base + 0x1fff).unwrap();
        assert_eq!(info.reference, b);
        assert_eq!(info.page_count, 2);
        assert!(space.find_region(b.base.offset_pages(2)).is_none());

        let fixed = VirtAddr::new(DEFAULT_USER_BASE + 0x10_0000);
        let object = anon(&mem, 1, AllocationStrategy::None);
        space.map_region(spec(&object, Placement::Fixed(fixed))).unwrap();
        assert_eq!(
            space.map_region(spec(&object, Placement::Fixed(fixed))),
            Err(VmError::InvalidRange)
        );
        assert_eq!(object.region_count(), 1);
    }

    #[test]
    fn eager_objects_are_mapped_immediately() {
        let mem = TestMemory::new(128);
        let space = space(1);
        let object = anon(&mem, 3, AllocationStrategy::AllocateNow);
        let region = space.map_region(spec(&object, Placement::Anywhere)).unwrap();
        let frame = object.physical_page(1).unwrap().unwrap().paddr();
        assert_eq!(space.translate(region.base.offset_pages(1) + 0x123), Some(frame + 0x123));
        assert_eq!(space.find_region(region.base).unwrap().mapped, 3);
    }

    #[test]
    fn unmap_releases_range_and_object() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let space = space(1);
        let region = space
            .map_region(spec(&anon(&mem, 10, AllocationStrategy::AllocateNow), Placement::Anywhere))
            .unwrap();
        assert_eq!(pmm.free_frames(), 118);
        space.unmap_region(region.base).unwrap();
        assert_eq!(pmm.free_frames(), 128);
        assert_eq!(space.translate(region.base), None);
        assert_eq!(space.unmap_region(region.base), Err(VmError::NoSuchRegion));

        // The range is reusable.
        let again = space
            .map_region(spec(&anon(&mem, 10, AllocationStrategy::None), Placement::Anywhere))
            .unwrap();
        assert_eq!(again.base, region.base);
    }

    #[test]
    fn fork_shares_pages_copy_on_write() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let parent = space(1);
        let object = anon(&mem, 8, AllocationStrategy::AllocateNow);
        let region = parent.map_region(spec(&object, Placement::Anywhere)).unwrap();
        let page5 = region.base.offset_pages(5);
        let original = object.physical_page(5).unwrap().unwrap();
        pmm.write_page(&original, 0, b"parent data");

        let child = parent
            .try_clone_for_fork(AddressSpaceId::from_raw(2), &pmm, Box::new(SoftPageTable::new()))
            .unwrap();
        assert_eq!(object.page_ref_count(5).unwrap(), Some(3), "parent, child, `original`");
        assert_eq!(child.translate(page5), Some(original.paddr()));

        // Both sides now fault on write.
        let (resolution, child_object) = child.handle_fault(&pmm, &write_fault(page5, true)).unwrap();
        assert_eq!(resolution.kind, ResolutionKind::CowCopied);
        assert_ne!(resolution.paddr, original.paddr());
        assert_eq!(child.translate(page5), Some(resolution.paddr));
        assert_eq!(parent.translate(page5), Some(original.paddr()));
        assert_eq!(object.page_ref_count(5).unwrap(), Some(2), "parent, `original`");
        assert!(!Arc::ptr_eq(&child_object, &object));

        let mut buf = [0u8; 11];
        let copy = child_object.physical_page(5).unwrap().unwrap();
        pmm.read_page(&copy, 0, &mut buf);
        assert_eq!(&buf, b"parent data");

        drop(original);
        let (resolution, _) = parent.handle_fault(&pmm, &write_fault(page5, true)).unwrap();
        assert_eq!(resolution.kind, ResolutionKind::CowReused);
    }

    #[test]
    fn fork_keeps_shared_regions_shared() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let parent = space(1);
        let object = anon(&mem, 2, AllocationStrategy::AllocateNow);
        let region = parent
            .map_region(RegionSpec {
                shared: true,
                ..spec(&object, Placement::Anywhere)
            })
            .unwrap();
        let child = parent
            .try_clone_for_fork(AddressSpaceId::from_raw(2), &pmm, Box::new(SoftPageTable::new()))
            .unwrap();
        assert_eq!(object.region_count(), 2);
        assert_eq!(object.cow_pages(), 0);
        assert_eq!(child.translate(region.base), parent.translate(region.base));

        drop(child);
        assert_eq!(object.region_count(), 1);
    }

    #[test]
    fn fork_protects_shared_view_of_cloned_object() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let parent = space(1);
        let object = anon(&mem, 1, AllocationStrategy::AllocateNow);
        let shared = parent
            .map_region(RegionSpec {
                shared: true,
                ..spec(&object, Placement::Anywhere)
            })
            .unwrap();
        let private = parent.map_region(spec(&object, Placement::Anywhere)).unwrap();
        let frame = object.physical_page(0).unwrap().unwrap().paddr();

        let child = parent
            .try_clone_for_fork(AddressSpaceId::from_raw(2), &pmm, Box::new(SoftPageTable::new()))
            .unwrap();
        assert_eq!(object.cow_pages(), 1);
        assert_eq!(child.translate(private.base), Some(frame));
        let (paddr, flags) = parent.translation(shared.base).unwrap();
        assert_eq!(paddr, frame);
        assert!(!flags.contains(MapFlags::WRITABLE), "shared view still writable: {flags:?}");

        // The write goes to a private copy; the child keeps the old frame.
        let (resolution, _) = parent.handle_fault(&pmm, &write_fault(shared.base, true)).unwrap();
        assert_eq!(resolution.kind, ResolutionKind::CowCopied);
        assert_ne!(resolution.paddr, frame);
        assert_eq!(child.translate(private.base), Some(frame));
        assert_eq!(parent.translate(shared.base), Some(resolution.paddr));
    }

    #[test]
    fn fork_copies_object_mapped_by_another_space() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let parent = space(1);
        let other = space(3);
        let object = anon(&mem, 2, AllocationStrategy::AllocateNow);
        let region = parent.map_region(spec(&object, Placement::Anywhere)).unwrap();
        let elsewhere = other.map_region(spec(&object, Placement::Anywhere)).unwrap();
        let page = object.physical_page(0).unwrap().unwrap();
        pmm.write_page(&page, 0, b"snapshot");

        let child = parent
            .try_clone_for_fork(AddressSpaceId::from_raw(2), &pmm, Box::new(SoftPageTable::new()))
            .unwrap();
        assert_eq!(object.cow_pages(), 0);
        let (_, flags) = other.translation(elsewhere.base).unwrap();
        assert!(flags.contains(MapFlags::WRITABLE));
        let copy = child.translate(region.base).unwrap();
        assert_ne!(copy, page.paddr());

        // Stores through the other space never reach the child.
        pmm.write_page(&page, 0, b"later!!!");
        let child_object = child.region_object(region.base).unwrap();
        let mut buf = [0u8; 8];
        pmm.read_page(&child_object.physical_page(0).unwrap().unwrap(), 0, &mut buf);
        assert_eq!(&buf, b"snapshot");
        assert_eq!(child.find_region(region.base).unwrap().resident, 2);
    }

    #[test]
    fn teardown_detaches_everything() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let space = space(1);
        let object = anon(&mem, 4, AllocationStrategy::AllocateNow);
        space.map_region(spec(&object, Placement::Anywhere)).unwrap();
        space.map_region(spec(&object, Placement::Anywhere)).unwrap();
        assert_eq!(object.region_count(), 2);
        space.teardown();
        assert_eq!(object.region_count(), 0);
        assert_eq!(space.region_count(), 0);
        drop(object);
        assert_eq!(pmm.free_frames(), 128);
    }
}
