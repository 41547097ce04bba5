//! The memory manager: one explicit context owning the physical allocator,
//! the address-space table and the registry of purgeable objects.
//!
//! The kernel builds one [`MemoryManager`] at boot from the bootloader's
//! memory map and keeps it for the lifetime of the system.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::sync::SpinLock;
use kestrel_core::{kdebug, kinfo};

use crate::address_space::{AddressSpace, AddressSpaceId, Placement, RegionRef, RegionSpec};
use crate::config::MmConfig;
use crate::fault::{FaultOutcome, FaultResolver, PageFault};
use crate::hhdm::Hhdm;
use crate::mapper::PageTable;
use crate::physical::PhysicalRegion;
use crate::pmm::{Pmm, SystemMemoryInfo};
use crate::region::Access;
use crate::vm::{AllocationStrategy, AnonymousVmObject, ContiguousVmObject, VmObject};
use crate::{PhysMemoryRegion, PmmError, VmError};

/// Snapshot of the manager's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmStats {
    /// Physical frame accounting.
    pub physical: SystemMemoryInfo,
    /// Live address spaces.
    pub address_spaces: usize,
    /// Live purgeable objects.
    pub purgeable_objects: usize,
}

/// The virtual memory subsystem.
pub struct MemoryManager {
    pmm: Arc<Pmm>,
    config: MmConfig,
    bootstrap: SpinLock<Option<PhysicalRegion>>,
    spaces: SpinLock<BTreeMap<AddressSpaceId, Arc<AddressSpace>>>,
    purgeable: SpinLock<Vec<Weak<VmObject>>>,
    next_id: AtomicU64,
}

impl MemoryManager {
    /// Builds the manager from the boot memory map.
    ///
    /// # Errors
    ///
    /// [`PmmError::NoUsableMemory`] if the map leaves no usable region.
    ///
    /// # Safety
    ///
    /// `map` must describe physical memory accurately, usable entries must
    /// be free for the taking and `hhdm` must map all of them.
    pub unsafe fn new(map: &[PhysMemoryRegion], config: MmConfig, hhdm: Hhdm) -> Result<Self, PmmError> {
        // SAFETY: Forwarded from the caller.
        let (pmm, bootstrap) = unsafe { Pmm::from_memory_map(map, &config, hhdm)? };
        let manager = Self::from_pmm(Arc::new(pmm), config);
        *manager.bootstrap.lock() = bootstrap;
        Ok(manager)
    }

    /// Wraps an already built allocator.
    pub fn from_pmm(pmm: Arc<Pmm>, config: MmConfig) -> Self {
        kinfo!(
            "MM: user range {}..{}, {} frames",
            config.user_base,
            config.user_end,
            pmm.total_frames()
        );
        Self {
            pmm,
            config,
            bootstrap: SpinLock::named("MmBootstrap", None),
            spaces: SpinLock::named("AddressSpaceTable", BTreeMap::new()),
            purgeable: SpinLock::named("PurgeableRegistry", Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The physical allocator.
    pub fn pmm(&self) -> &Arc<Pmm> {
        &self.pmm
    }

    /// The configuration in use.
    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    /// Hands out the bootstrap region split off at boot, once.
    pub fn take_bootstrap_region(&self) -> Option<PhysicalRegion> {
        self.bootstrap.lock().take()
    }

    // -----------------------------------------------------------------------
    // Address spaces
    // -----------------------------------------------------------------------

    fn next_id(&self) -> AddressSpaceId {
        AddressSpaceId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates an empty address space over `table`.
    pub fn create_address_space(&self, table: Box<dyn PageTable>) -> Arc<AddressSpace> {
        let id = self.next_id();
        let space = Arc::new(AddressSpace::new(
            id,
            table,
            self.config.user_base,
            self.config.user_end,
        ));
        self.spaces.lock().insert(id, Arc::clone(&space));
        kdebug!("MM: created {:?}", id);
        space
    }

    /// Looks up an address space.
    pub fn address_space(&self, id: AddressSpaceId) -> Result<Arc<AddressSpace>, VmError> {
        self.spaces
            .lock()
            .get(&id)
            .cloned()
            .ok_or(VmError::NoSuchAddressSpace)
    }

    /// Removes an address space and tears down its regions.
    pub fn destroy_address_space(&self, id: AddressSpaceId) -> Result<(), VmError> {
        let space = self
            .spaces
            .lock()
            .remove(&id)
            .ok_or(VmError::NoSuchAddressSpace)?;
        space.teardown();
        kdebug!("MM: destroyed {:?}", id);
        Ok(())
    }

    /// Forks `parent` into a new address space over `table`.
    pub fn fork_address_space(
        &self,
        parent: AddressSpaceId,
        table: Box<dyn PageTable>,
    ) -> Result<Arc<AddressSpace>, VmError> {
        let parent = self.address_space(parent)?;
        let child = Arc::new(parent.try_clone_for_fork(self.next_id(), &self.pmm, table)?);
        for info in child.regions() {
            if info.purgeable {
                if let Some(object) = child.region_object(info.reference.base) {
                    self.register_purgeable(&object);
                }
            }
        }
        self.spaces.lock().insert(child.id(), Arc::clone(&child));
        Ok(child)
    }

    // -----------------------------------------------------------------------
    // Objects and mappings
    // -----------------------------------------------------------------------

    /// Creates an anonymous object. Purgeable objects join the global purge.
    pub fn create_anonymous(
        &self,
        page_count: usize,
        strategy: AllocationStrategy,
        purgeable: bool,
    ) -> Result<Arc<VmObject>, VmError> {
        let object = Arc::new(VmObject::Anonymous(AnonymousVmObject::try_create(
            &self.pmm, page_count, strategy, purgeable,
        )?));
        if purgeable {
            self.register_purgeable(&object);
        }
        Ok(object)
    }

    fn register_purgeable(&self, object: &Arc<VmObject>) {
        let mut registry = self.purgeable.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        if !registry.iter().any(|weak| core::ptr::eq(weak.as_ptr(), Arc::as_ptr(object))) {
            registry.push(Arc::downgrade(object));
        }
    }

    /// Wraps `page_count` frames of unmanaged physical memory from `base`,
    /// such as a device aperture, in an anonymous object.
    pub fn create_for_physical_range(&self, base: PhysAddr, page_count: usize) -> Result<Arc<VmObject>, VmError> {
        let object = AnonymousVmObject::try_create_for_physical_range(&self.pmm, base, page_count)?;
        kdebug!("MM: physical range {} ({} pages)", base, page_count);
        Ok(Arc::new(VmObject::Anonymous(object)))
    }

    /// Allocates `page_count` physically contiguous pages for a device.
    pub fn allocate_contiguous(&self, page_count: usize) -> Result<Arc<VmObject>, VmError> {
        let object = ContiguousVmObject::try_create(&self.pmm, page_count)?;
        kdebug!("MM: contiguous {} pages at {}", page_count, object.base());
        Ok(Arc::new(VmObject::Contiguous(object)))
    }

    /// Maps a region into `space`.
    pub fn map(&self, space: AddressSpaceId, spec: RegionSpec) -> Result<RegionRef, VmError> {
        self.address_space(space)?.map_region(spec)
    }

    /// Creates a private anonymous object and maps all of it anywhere.
    pub fn map_anonymous(
        &self,
        space: AddressSpaceId,
        page_count: usize,
        strategy: AllocationStrategy,
        access: Access,
    ) -> Result<RegionRef, VmError> {
        let object = self.create_anonymous(page_count, strategy, false)?;
        self.map(space, RegionSpec {
            object,
            offset_in_object: 0,
            page_count,
            placement: Placement::Anywhere,
            access,
            shared: false,
            purgeable: false,
            cacheable: true,
            kernel_only: false,
            name: "anonymous",
        })
    }

    /// Tears down a region.
    pub fn unmap(&self, region: RegionRef) -> Result<(), VmError> {
        self.address_space(region.space)?.unmap_region(region.base)
    }

    // -----------------------------------------------------------------------
    // Volatile memory
    // -----------------------------------------------------------------------

    /// Marks region pages `[first, first + count)` volatile.
    pub fn set_volatile(&self, region: RegionRef, first: usize, count: usize) -> Result<(), VmError> {
        self.address_space(region.space)?
            .set_volatile(region.base.offset_pages(first), count)
    }

    /// Marks region pages `[first, first + count)` non-volatile. Returns
    /// `true` if any of them was purged since it was made volatile; the
    /// caller must then [`repopulate`](Self::repopulate) before touching
    /// them.
    pub fn set_nonvolatile(&self, region: RegionRef, first: usize, count: usize) -> Result<bool, VmError> {
        self.address_space(region.space)?
            .set_nonvolatile(region.base.offset_pages(first), count)
    }

    /// Lets purged pages in `[first, first + count)` zero-fill on next touch.
    pub fn repopulate(&self, region: RegionRef, first: usize, count: usize) -> Result<usize, VmError> {
        self.address_space(region.space)?
            .repopulate(region.base.offset_pages(first), count)
    }

    /// Purges the volatile pages of every registered object. Returns the
    /// number of frames reclaimed.
    ///
    /// Pages leave each object under its lock, then their translations are
    /// removed region by region, and only then are the frames freed.
    pub fn purge_all_volatile(&self) -> usize {
        let objects: Vec<Arc<VmObject>> = {
            let mut registry = self.purgeable.lock();
            registry.retain(|weak| weak.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };

        let mut total = 0;
        for object in &objects {
            let Some(anon) = object.as_anonymous() else {
                continue;
            };
            if !anon.is_any_volatile() {
                continue;
            }
            let purged = anon.purge();
            if purged.count() == 0 {
                continue;
            }
            for region in purged.regions() {
                if let Ok(space) = self.address_space(region.space) {
                    space.remap_object_pages(object, region.base, purged.indices());
                }
            }
            total += purged.count();
            drop(purged);
        }
        if total > 0 {
            kinfo!("MM: purged {} volatile pages from {} objects", total, objects.len());
        }
        total
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    /// Resolves a page fault in `space`.
    pub fn handle_page_fault(&self, space: AddressSpaceId, fault: PageFault) -> FaultOutcome {
        match self.address_space(space) {
            Ok(space) => FaultResolver::new(self, space, fault).run(),
            Err(err) => FaultOutcome::Fatal(err),
        }
    }

    /// Refreshes object page `object_index` in every region mapping
    /// `object` except `exclude`.
    pub(crate) fn remap_object_page(&self, object: &Arc<VmObject>, object_index: usize, exclude: RegionRef) {
        let mut regions = Vec::new();
        object.for_each_region(|region| {
            if region != exclude {
                regions.push(region);
            }
        });
        for region in regions {
            if let Ok(space) = self.address_space(region.space) {
                space.remap_object_pages(object, region.base, [object_index]);
            }
        }
    }

    /// Current bookkeeping.
    pub fn stats(&self) -> MmStats {
        MmStats {
            physical: self.pmm.stats(),
            address_spaces: self.spaces.lock().len(),
            purgeable_objects: self
                .purgeable
                .lock()
                .iter()
                .filter(|weak| weak.strong_count() > 0)
                .count(),
        }
    }

    /// Translates `addr` in `space`.
    pub fn translate(&self, space: AddressSpaceId, addr: VirtAddr) -> Option<PhysAddr> {
        self.address_space(space).ok()?.translate(addr)
    }
}

impl core::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("pmm", &self.pmm)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
