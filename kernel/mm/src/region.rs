//! Regions: windows of a VM object mapped into an address space.
//!
//! A [`Region`] owns the translations it installed for
//! `[base, base + page_count * PAGE_SIZE)` and receives the page faults for
//! that range. The object decides which frame backs a page; the region
//! decides how it is mapped.

use alloc::sync::Arc;

use kestrel_core::PAGE_SIZE;
use kestrel_core::addr::VirtAddr;
use kestrel_core::ktrace;

use crate::VmError;
use crate::address_space::{AddressSpaceId, RegionRef};
use crate::bitmap::Bitmap;
use crate::fault::{FaultAccess, PageFault, Resolution, ResolutionKind};
use crate::mapper::{MapFlags, PageTable};
use crate::pmm::Pmm;
use crate::vm::{Commit, SlotMapping, VmObject, VolatilePageRanges};

bitflags::bitflags! {
    /// Access permitted through a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        /// Loads.
        const READ    = 1 << 0;
        /// Stores.
        const WRITE   = 1 << 1;
        /// Instruction fetches.
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    /// Read and write.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Whether a fault of kind `access` is allowed.
    pub fn permits(self, access: FaultAccess) -> bool {
        match access {
            FaultAccess::Read => self.contains(Self::READ),
            FaultAccess::Write => self.contains(Self::WRITE),
            FaultAccess::Execute => self.contains(Self::EXECUTE),
        }
    }
}

/// A mapping of object pages `[offset, offset + page_count)` at `base`.
pub struct Region {
    space: AddressSpaceId,
    base: VirtAddr,
    page_count: usize,
    offset_in_object: usize,
    access: Access,
    shared: bool,
    purgeable: bool,
    cacheable: bool,
    kernel_only: bool,
    name: &'static str,
    object: Arc<VmObject>,
    installed: Bitmap,
}

impl Region {
    /// Creates a region and attaches it to `object`.
    ///
    /// If `purgeable` is set the region registers `initial` as its volatile
    /// ranges with the object. Nothing is mapped yet.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach(
        space: AddressSpaceId,
        base: VirtAddr,
        page_count: usize,
        offset_in_object: usize,
        access: Access,
        shared: bool,
        purgeable: Option<VolatilePageRanges>,
        name: &'static str,
        object: Arc<VmObject>,
    ) -> Result<Self, VmError> {
        let end = offset_in_object
            .checked_add(page_count)
            .ok_or(VmError::OutOfBoundsAccess)?;
        if page_count == 0 || !base.is_page_aligned() {
            return Err(VmError::InvalidRange);
        }
        if end > object.page_count() {
            return Err(VmError::OutOfBoundsAccess);
        }
        let reference = RegionRef { space, base };
        let is_purgeable = purgeable.is_some();
        if let Some(initial) = purgeable {
            object
                .as_anonymous()
                .ok_or(VmError::NotPurgeable)?
                .register_purgeable_page_ranges(reference, initial)?;
        }
        object.add_region(reference);
        Ok(Self {
            space,
            base,
            page_count,
            offset_in_object,
            access,
            shared,
            purgeable: is_purgeable,
            cacheable: true,
            kernel_only: false,
            name,
            object,
            installed: Bitmap::new(page_count),
        })
    }

    /// Maps the region with caching disabled when `cacheable` is false.
    /// Takes effect for translations installed afterwards.
    pub(crate) fn set_cacheable(&mut self, cacheable: bool) {
        self.cacheable = cacheable;
    }

    /// Keeps the region's translations out of reach of user mode.
    /// Takes effect for translations installed afterwards.
    pub(crate) fn set_kernel_only(&mut self, kernel_only: bool) {
        self.kernel_only = kernel_only;
    }

    /// Handle naming this region.
    pub fn reference(&self) -> RegionRef {
        RegionRef {
            space: self.space,
            base: self.base,
        }
    }

    /// First mapped address.
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// One past the last mapped address.
    pub fn end(&self) -> VirtAddr {
        self.base.offset_pages(self.page_count)
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        (self.page_count * PAGE_SIZE) as u64
    }

    /// Length in pages.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Object page mapped at `base`.
    pub fn offset_in_object(&self) -> usize {
        self.offset_in_object
    }

    /// Permission mask.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Shared mappings keep their object across fork instead of going COW.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether this region registered volatile ranges with its object.
    pub fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    /// Whether translations are installed cacheable.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Whether the region is inaccessible from user mode.
    pub fn is_kernel_only(&self) -> bool {
        self.kernel_only
    }

    /// Debug name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The object mapped.
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    /// Whether `addr` lies inside the region.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Whether the translation of region page `index` is installed.
    pub fn is_installed(&self, index: usize) -> bool {
        self.installed.get(index)
    }

    /// Region page index of `addr`.
    pub(crate) fn page_index(&self, addr: VirtAddr) -> usize {
        addr.pages_from(self.base)
    }

    /// Translates region pages `[first, first + count)` to object pages.
    fn object_span(&self, first: usize, count: usize) -> Result<usize, VmError> {
        match first.checked_add(count) {
            Some(end) if count > 0 && end <= self.page_count => Ok(self.offset_in_object + first),
            _ => Err(VmError::InvalidRange),
        }
    }

    fn flags_for(&self, mapping: SlotMapping) -> MapFlags {
        let mut flags = if self.kernel_only {
            MapFlags::empty()
        } else {
            MapFlags::USER
        };
        if !self.cacheable {
            flags |= MapFlags::CACHE_DISABLE;
        }
        if self.access.contains(Access::WRITE) && !mapping.cow {
            flags |= MapFlags::WRITABLE;
        }
        if self.access.contains(Access::EXECUTE) {
            flags |= MapFlags::EXECUTABLE;
        }
        flags
    }

    // -----------------------------------------------------------------------
    // Translations
    // -----------------------------------------------------------------------

    /// Installs or updates the translation of region page `index` for the
    /// frame in `mapping`.
    pub(crate) fn map_page(
        &mut self,
        table: &mut dyn PageTable,
        index: usize,
        mapping: SlotMapping,
    ) -> Result<(), VmError> {
        if self.access.is_empty() {
            return Ok(());
        }
        let page = self.base.offset_pages(index);
        let flags = self.flags_for(mapping);
        if self.installed.get(index) {
            match table.translate(page) {
                Some((paddr, old)) if paddr == mapping.paddr => {
                    if old != flags {
                        table
                            .update_flags(page, flags)
                            .map_err(|_| VmError::MapFailed)?
                            .flush();
                    }
                    return Ok(());
                }
                _ => self.unmap_page(table, index),
            }
        }
        table
            .map(page, mapping.paddr, flags)
            .map_err(|_| VmError::MapFailed)?
            .ignore();
        self.installed.set(index);
        Ok(())
    }

    /// Removes the translation of region page `index`, if any.
    pub(crate) fn unmap_page(&mut self, table: &mut dyn PageTable, index: usize) {
        if !self.installed.get(index) {
            return;
        }
        if let Ok((_, flush)) = table.unmap(self.base.offset_pages(index)) {
            flush.flush();
        }
        self.installed.clear(index);
    }

    /// Brings region page `index` in line with its object slot: mapped with
    /// current permissions if backed, unmapped otherwise.
    pub(crate) fn remap_page(&mut self, table: &mut dyn PageTable, index: usize) -> Result<(), VmError> {
        match self.object.slot_mapping(self.offset_in_object + index) {
            Some(mapping) => self.map_page(table, index, mapping),
            None => {
                self.unmap_page(table, index);
                Ok(())
            }
        }
    }

    /// Remaps the region page showing object page `object_index`, if the
    /// region covers it.
    pub(crate) fn remap_object_page(
        &mut self,
        table: &mut dyn PageTable,
        object_index: usize,
    ) -> Result<(), VmError> {
        match object_index.checked_sub(self.offset_in_object) {
            Some(index) if index < self.page_count => self.remap_page(table, index),
            _ => Ok(()),
        }
    }

    /// [`remap_page`](Self::remap_page) over the whole region.
    pub(crate) fn remap_all(&mut self, table: &mut dyn PageTable) -> Result<(), VmError> {
        (0..self.page_count).try_for_each(|index| self.remap_page(table, index))
    }

    /// Removes every installed translation.
    pub(crate) fn unmap(&mut self, table: &mut dyn PageTable) {
        let installed: alloc::vec::Vec<usize> = self.installed.iter_ones().collect();
        for index in installed {
            self.unmap_page(table, index);
        }
    }

    /// Unmaps the region and detaches it from its object.
    pub(crate) fn detach(mut self, table: &mut dyn PageTable) {
        self.unmap(table);
        self.release();
    }

    /// Detaches from the object without touching page tables. Only valid
    /// while nothing is installed.
    pub(crate) fn release(self) {
        debug_assert_eq!(self.installed.count_ones(), 0, "releasing a mapped region");
        let reference = self.reference();
        if self.purgeable {
            if let Some(anon) = self.object.as_anonymous() {
                anon.unregister_purgeable_page_ranges(reference);
            }
        }
        self.object.remove_region(reference);
    }

    /// A copy of this region for a forked address space, attached to
    /// `object` (a COW clone, or the same object for shared regions). The
    /// volatile ranges are carried over.
    pub(crate) fn fork_into(
        &self,
        space: AddressSpaceId,
        object: Arc<VmObject>,
    ) -> Result<Region, VmError> {
        let volatile = if self.purgeable {
            let ranges = self
                .object
                .as_anonymous()
                .and_then(|anon| anon.volatile_ranges(self.reference()))
                .unwrap_or_default();
            Some(ranges)
        } else {
            None
        };
        let mut forked = Region::attach(
            space,
            self.base,
            self.page_count,
            self.offset_in_object,
            self.access,
            self.shared,
            volatile,
            self.name,
            object,
        )?;
        forked.cacheable = self.cacheable;
        forked.kernel_only = self.kernel_only;
        Ok(forked)
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    /// Resolves a fault inside this region.
    ///
    /// # Errors
    ///
    /// [`VmError::ProtectionViolation`] for accesses the mask forbids and
    /// for present faults that are not copy-on-write,
    /// [`VmError::CapacityExhausted`] when no frame is available,
    /// [`VmError::StaleVolatileAccess`] for purged pages not yet
    /// repopulated.
    pub fn handle_fault(
        &mut self,
        pmm: &Pmm,
        table: &mut dyn PageTable,
        fault: &PageFault,
    ) -> Result<Resolution, VmError> {
        if !self.access.permits(fault.access) {
            return Err(VmError::ProtectionViolation);
        }
        let index = self.page_index(fault.address);
        let object_index = self.offset_in_object + index;
        let object = Arc::clone(&self.object);

        let (mapping, kind) = match &*object {
            VmObject::Anonymous(anon) if !fault.present => {
                let (mut mapping, mut kind) = match anon.commit_page(pmm, object_index)? {
                    Commit::Present(mapping) => (mapping, ResolutionKind::Remapped),
                    Commit::Allocated(paddr) => (SlotMapping { paddr, cow: false }, ResolutionKind::ZeroFilled),
                };
                // A write to a not-yet-mapped COW page resolves both at once.
                if fault.access == FaultAccess::Write && mapping.cow {
                    let cow = anon.handle_cow_fault(pmm, object_index, fault.address)?;
                    mapping = SlotMapping { paddr: cow.paddr(), cow: false };
                    kind = ResolutionKind::from(cow);
                }
                (mapping, kind)
            }
            VmObject::Anonymous(anon) if fault.access == FaultAccess::Write => {
                match anon.slot_mapping(object_index) {
                    Some(mapping) if mapping.cow => {
                        let cow = anon.handle_cow_fault(pmm, object_index, fault.address)?;
                        (SlotMapping { paddr: cow.paddr(), cow: false }, ResolutionKind::from(cow))
                    }
                    // A sibling region resolved the COW first; our
                    // translation is merely out of date.
                    Some(mapping) if !self.is_writable_installed(table, index) => {
                        (mapping, ResolutionKind::Remapped)
                    }
                    _ => return Err(VmError::ProtectionViolation),
                }
            }
            VmObject::Contiguous(_) if !fault.present => {
                let mapping = object
                    .slot_mapping(object_index)
                    .ok_or(VmError::OutOfBoundsAccess)?;
                (mapping, ResolutionKind::Remapped)
            }
            _ => return Err(VmError::ProtectionViolation),
        };

        self.map_page(table, index, mapping)?;
        ktrace!(
            "Region '{}': {:?} fault at {} -> {} ({:?})",
            self.name,
            fault.access,
            fault.address,
            mapping.paddr,
            kind
        );
        Ok(Resolution {
            region: self.reference(),
            object_index,
            paddr: mapping.paddr,
            kind,
        })
    }

    fn is_writable_installed(&self, table: &dyn PageTable, index: usize) -> bool {
        self.installed.get(index)
            && table
                .translate(self.base.offset_pages(index))
                .is_some_and(|(_, flags)| flags.contains(MapFlags::WRITABLE))
    }

    // -----------------------------------------------------------------------
    // Volatile ranges
    // -----------------------------------------------------------------------

    /// Marks region pages `[first, first + count)` volatile.
    pub fn set_volatile(&self, first: usize, count: usize) -> Result<(), VmError> {
        let start = self.object_span(first, count)?;
        self.purgeable_object()?
            .set_volatile(self.reference(), start, count)
    }

    /// Marks region pages `[first, first + count)` non-volatile, returning
    /// whether any of them was purged in the meantime.
    pub fn set_nonvolatile(&self, first: usize, count: usize) -> Result<bool, VmError> {
        let start = self.object_span(first, count)?;
        self.purgeable_object()?
            .set_nonvolatile(self.reference(), start, count)
    }

    /// Allows purged pages in `[first, first + count)` to be zero-filled on
    /// the next touch. Returns how many pages were purged.
    pub fn repopulate(&self, first: usize, count: usize) -> Result<usize, VmError> {
        let start = self.object_span(first, count)?;
        self.purgeable_object()?.repopulate(start, count)
    }

    fn purgeable_object(&self) -> Result<&crate::vm::AnonymousVmObject, VmError> {
        if !self.purgeable {
            return Err(VmError::NotPurgeable);
        }
        self.object.as_anonymous().ok_or(VmError::NotPurgeable)
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    // The window was checked against the object in `attach`.

    /// Pages of the region backed by a frame.
    pub fn amount_resident(&self) -> usize {
        self.object
            .resident_pages(self.offset_in_object, self.page_count)
            .unwrap_or(0)
    }

    /// Pages of the region whose frame is shared with another object.
    pub fn amount_shared(&self) -> usize {
        self.object
            .shared_pages(self.offset_in_object, self.page_count)
            .unwrap_or(0)
    }

    /// Pages that would have to be written back before their frames could
    /// be reused. Anonymous and contiguous memory has no backing store, so
    /// every resident page counts.
    pub fn amount_dirty(&self) -> usize {
        self.amount_resident()
    }

    /// Pages of the region installed in the page table.
    pub fn amount_mapped(&self) -> usize {
        self.installed.count_ones()
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("page_count", &self.page_count)
            .field("offset_in_object", &self.offset_in_object)
            .field("access", &self.access)
            .field("shared", &self.shared)
            .field("purgeable", &self.purgeable)
            .field("cacheable", &self.cacheable)
            .field("kernel_only", &self.kernel_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SoftPageTable, TestMemory};
    use crate::vm::{AllocationStrategy, AnonymousVmObject};

    const SPACE: AddressSpaceId = AddressSpaceId::from_raw(7);
    const BASE: VirtAddr = VirtAddr::new(0x40_0000);

    fn anon_object(mem: &TestMemory, pages: usize) -> Arc<VmObject> {
        let obj = AnonymousVmObject::try_create(&mem.pmm(), pages, AllocationStrategy::None, true).unwrap();
        Arc::new(VmObject::Anonymous(obj))
    }

    fn region(object: &Arc<VmObject>, access: Access) -> Region {
        Region::attach(SPACE, BASE, object.page_count(), 0, access, false, None, "test", Arc::clone(object))
            .unwrap()
    }

    fn fault(index: usize, access: FaultAccess, present: bool) -> PageFault {
        PageFault {
            address: BASE.offset_pages(index) + 0x10,
            access,
            present,
        }
    }

    #[test]
    fn attach_checks_bounds() {
        let mem = TestMemory::new(128);
        let object = anon_object(&mem, 4);
        let err = Region::attach(SPACE, BASE, 3, 2, Access::READ, false, None, "oob", Arc::clone(&object));
        assert_eq!(err.unwrap_err(), VmError::OutOfBoundsAccess);
        assert_eq!(object.region_count(), 0);
    }

    #[test]
    fn read_fault_zero_fills_and_maps_writable() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let object = anon_object(&mem, 4);
        let mut region = region(&object, Access::RW);
        let mut table = SoftPageTable::new();

        let res = region
            .handle_fault(&pmm, &mut table, &fault(2, FaultAccess::Read, false))
            .unwrap();
        assert_eq!(res.kind, ResolutionKind::ZeroFilled);
        assert_eq!(res.object_index, 2);
        let (paddr, flags) = table.translate(BASE.offset_pages(2)).unwrap();
        assert_eq!(paddr, res.paddr);
        assert!(flags.contains(MapFlags::WRITABLE | MapFlags::USER));
        assert!(!flags.contains(MapFlags::EXECUTABLE));
        assert_eq!(region.amount_resident(), 1);

        // Lost translation, backed slot: reinstalled without allocating.
        region.unmap(&mut table);
        let free = pmm.free_frames();
        let res = region
            .handle_fault(&pmm, &mut table, &fault(2, FaultAccess::Write, false))
            .unwrap();
        assert_eq!(res.kind, ResolutionKind::Remapped);
        assert_eq!(pmm.free_frames(), free);
    }

    #[test]
    fn attributes_shape_translation_flags() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let object = anon_object(&mem, 2);
        let mut region = region(&object, Access::RW);
        region.set_cacheable(false);
        region.set_kernel_only(true);
        let mut table = SoftPageTable::new();

        region
            .handle_fault(&pmm, &mut table, &fault(1, FaultAccess::Write, false))
            .unwrap();
        let (_, flags) = table.translate(BASE.offset_pages(1)).unwrap();
        assert_eq!(flags, MapFlags::WRITABLE | MapFlags::CACHE_DISABLE);
        assert_eq!(region.amount_dirty(), 1);

        let child = region
            .fork_into(AddressSpaceId::from_raw(8), Arc::clone(&object))
            .unwrap();
        assert!(!child.is_cacheable() && child.is_kernel_only());
        child.release();
        region.detach(&mut table);
    }

    #[test]
    fn protection_is_enforced() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let object = anon_object(&mem, 2);
        let mut region = region(&object, Access::READ);
        let mut table = SoftPageTable::new();

        assert_eq!(
            region.handle_fault(&pmm, &mut table, &fault(0, FaultAccess::Write, false)),
            Err(VmError::ProtectionViolation)
        );
        region
            .handle_fault(&pmm, &mut table, &fault(0, FaultAccess::Read, false))
            .unwrap();
        let (_, flags) = table.translate(BASE).unwrap();
        assert!(!flags.contains(MapFlags::WRITABLE));
        assert_eq!(
            region.handle_fault(&pmm, &mut table, &fault(0, FaultAccess::Execute, true)),
            Err(VmError::ProtectionViolation)
        );
    }

    #[test]
    fn present_write_on_private_page_is_a_violation() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let object = anon_object(&mem, 1);
        let mut region = region(&object, Access::RW);
        let mut table = SoftPageTable::new();
        region
            .handle_fault(&pmm, &mut table, &fault(0, FaultAccess::Write, false))
            .unwrap();
        assert_eq!(
            region.handle_fault(&pmm, &mut table, &fault(0, FaultAccess::Write, true)),
            Err(VmError::ProtectionViolation)
        );
    }

    #[test]
    fn teardown_releases_object() {
        let mem = TestMemory::new(128);
        let pmm = mem.pmm();
        let object = anon_object(&mem, 10);
        let mut region = region(&object, Access::RW);
        let mut table = SoftPageTable::new();
        for index in 0..10 {
            region
                .handle_fault(&pmm, &mut table, &fault(index, FaultAccess::Write, false))
                .unwrap();
        }
        assert_eq!(pmm.free_frames(), 118);
        assert_eq!(object.region_count(), 1);

        region.detach(&mut table);
        assert_eq!(object.region_count(), 0);
        assert!(table.is_empty());
        drop(object);
        assert_eq!(pmm.free_frames(), 128);
    }

    #[test]
    fn volatile_operations_need_a_purgeable_region() {
        let mem = TestMemory::new(128);
        let object = anon_object(&mem, 4);
        let plain = region(&object, Access::RW);
        assert_eq!(plain.set_volatile(0, 1), Err(VmError::NotPurgeable));

        let purgeable = Region::attach(
            SPACE,
            VirtAddr::new(0x80_0000),
            2,
            2,
            Access::RW,
            false,
            Some(VolatilePageRanges::new()),
            "purgeable",
            Arc::clone(&object),
        )
        .unwrap();
        purgeable.set_volatile(0, 2).unwrap();
        assert_eq!(purgeable.set_volatile(1, 2), Err(VmError::InvalidRange));
        let ranges = object
            .as_anonymous()
            .unwrap()
            .volatile_ranges(purgeable.reference())
            .unwrap();
        assert_eq!(ranges.indices().collect::<alloc::vec::Vec<_>>(), [2, 3]);
        assert!(!purgeable.set_nonvolatile(0, 2).unwrap());
    }
}
