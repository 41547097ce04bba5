//! Physically contiguous VM objects for DMA consumers.
//!
//! Always fully backed, never copy-on-write, never purgeable.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_core::addr::PhysAddr;
use kestrel_core::sync::SpinLock;

use crate::VmError;
use crate::address_space::RegionRef;
use crate::physical::PhysicalPage;
use crate::pmm::{Pmm, ShouldZeroFill};

/// A VM object backed by one physically contiguous run of frames.
pub struct ContiguousVmObject {
    pages: Vec<PhysicalPage>,
    regions: SpinLock<Vec<RegionRef>>,
}

impl ContiguousVmObject {
    /// Allocates `page_count` contiguous, zeroed frames.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidRange`] for zero pages, [`VmError::CapacityExhausted`]
    /// if no zone holds a long enough free run.
    pub fn try_create(pmm: &Pmm, page_count: usize) -> Result<Self, VmError> {
        if page_count == 0 {
            return Err(VmError::InvalidRange);
        }
        let pages = pmm.allocate_contiguous(page_count, ShouldZeroFill::Yes)?;
        Ok(Self::from_pages(pages))
    }

    fn from_pages(pages: Vec<PhysicalPage>) -> Self {
        Self {
            pages,
            regions: SpinLock::named("ContiguousVmObject", Vec::new()),
        }
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Physical address of the first frame, for programming a device.
    pub fn base(&self) -> PhysAddr {
        self.pages[0].paddr()
    }

    /// Returns a handle to page `index`.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if `index >= page_count`.
    pub fn physical_page(&self, index: usize) -> Result<PhysicalPage, VmError> {
        self.pages
            .get(index)
            .cloned()
            .ok_or(VmError::OutOfBoundsAccess)
    }

    pub(crate) fn check_window(&self, first: usize, count: usize) -> Result<(), VmError> {
        match first.checked_add(count) {
            Some(end) if end <= self.pages.len() => Ok(()),
            _ => Err(VmError::OutOfBoundsAccess),
        }
    }

    pub(crate) fn paddr(&self, index: usize) -> Option<PhysAddr> {
        self.pages.get(index).map(PhysicalPage::paddr)
    }

    /// Deep copy into a freshly allocated contiguous run.
    pub fn try_clone(&self, pmm: &Arc<Pmm>) -> Result<Self, VmError> {
        let copies = pmm.allocate_contiguous(self.pages.len(), ShouldZeroFill::No)?;
        for (src, dst) in self.pages.iter().zip(&copies) {
            pmm.copy_page(src, dst);
        }
        Ok(Self::from_pages(copies))
    }

    pub(crate) fn add_region(&self, region: RegionRef) {
        self.regions.lock().push(region);
    }

    pub(crate) fn remove_region(&self, region: RegionRef) {
        self.regions.lock().retain(|r| *r != region);
    }

    pub(crate) fn for_each_region(&self, mut f: impl FnMut(RegionRef)) {
        for region in self.regions.lock().iter() {
            f(*region);
        }
    }
}

impl core::fmt::Debug for ContiguousVmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContiguousVmObject")
            .field("base", &self.base())
            .field("page_count", &self.page_count())
            .finish_non_exhaustive()
    }
}
