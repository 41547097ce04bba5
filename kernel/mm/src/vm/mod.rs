//! VM objects: the page containers that regions map.
//!
//! [`VmObject`] is a closed set of variants sharing one capability surface
//! (bounds-checked page lookup, cloning, region iteration). Objects are
//! shared through `Arc<VmObject>`; the last region or handle to go away
//! destroys the object and releases its frames. A file-backed variant would
//! be another arm of the enum.

mod anonymous;
mod contiguous;
mod purgeable;

use alloc::sync::Arc;

pub use anonymous::{AllocationStrategy, AnonymousVmObject, CowResolution, PurgedPages};
pub(crate) use anonymous::{Commit, SlotMapping};
pub use contiguous::ContiguousVmObject;
pub use purgeable::{VolatilePageRange, VolatilePageRanges};

use crate::VmError;
use crate::address_space::{AddressSpaceId, RegionRef};
use crate::physical::PhysicalPage;
use crate::pmm::Pmm;

/// A VM object.
#[derive(Debug)]
pub enum VmObject {
    /// Zero-fill-on-demand memory with COW and purgeable ranges.
    Anonymous(AnonymousVmObject),
    /// Physically contiguous, eagerly backed memory.
    Contiguous(ContiguousVmObject),
}

impl VmObject {
    /// Number of pages in the object.
    pub fn page_count(&self) -> usize {
        match self {
            Self::Anonymous(obj) => obj.page_count(),
            Self::Contiguous(obj) => obj.page_count(),
        }
    }

    /// Returns a handle to the page in slot `index`, if backed.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if `index >= page_count()`.
    pub fn physical_page(&self, index: usize) -> Result<Option<PhysicalPage>, VmError> {
        match self {
            Self::Anonymous(obj) => obj.physical_page(index),
            Self::Contiguous(obj) => obj.physical_page(index).map(Some),
        }
    }

    /// Reference count of the page in slot `index`, not counting any handle
    /// created by the query itself.
    pub fn page_ref_count(&self, index: usize) -> Result<Option<usize>, VmError> {
        match self {
            Self::Anonymous(obj) => obj.page_ref_count(index),
            Self::Contiguous(obj) => obj.physical_page(index).map(|p| Some(p.ref_count() - 1)),
        }
    }

    /// Creates an independent object with the same contents.
    ///
    /// Anonymous objects share their frames copy-on-write; contiguous
    /// objects are deep-copied.
    pub fn try_clone(&self, pmm: &Arc<Pmm>) -> Result<VmObject, VmError> {
        Ok(match self {
            Self::Anonymous(obj) => Self::Anonymous(obj.try_clone(pmm)?),
            Self::Contiguous(obj) => Self::Contiguous(obj.try_clone(pmm)?),
        })
    }

    /// Creates the child's object for a fork of address space `space`.
    ///
    /// Anonymous objects share their frames copy-on-write unless another
    /// space maps them as well, in which case they are copied; contiguous
    /// objects are always deep-copied.
    pub fn try_clone_for_fork(&self, pmm: &Arc<Pmm>, space: AddressSpaceId) -> Result<VmObject, VmError> {
        Ok(match self {
            Self::Anonymous(obj) => Self::Anonymous(obj.try_clone_for_fork(pmm, space)?),
            Self::Contiguous(obj) => Self::Contiguous(obj.try_clone(pmm)?),
        })
    }

    /// Calls `f` for every region mapping this object, under the object lock.
    pub fn for_each_region(&self, f: impl FnMut(RegionRef)) {
        match self {
            Self::Anonymous(obj) => obj.for_each_region(f),
            Self::Contiguous(obj) => obj.for_each_region(f),
        }
    }

    /// Number of regions mapping this object.
    pub fn region_count(&self) -> usize {
        let mut count = 0;
        self.for_each_region(|_| count += 1);
        count
    }

    /// The anonymous variant, if this is one.
    pub fn as_anonymous(&self) -> Option<&AnonymousVmObject> {
        match self {
            Self::Anonymous(obj) => Some(obj),
            Self::Contiguous(_) => None,
        }
    }

    /// Whether volatile ranges may be registered.
    pub fn is_purgeable(&self) -> bool {
        self.as_anonymous().is_some_and(AnonymousVmObject::is_purgeable)
    }

    pub(crate) fn add_region(&self, region: RegionRef) {
        match self {
            Self::Anonymous(obj) => obj.add_region(region),
            Self::Contiguous(obj) => obj.add_region(region),
        }
    }

    pub(crate) fn remove_region(&self, region: RegionRef) {
        match self {
            Self::Anonymous(obj) => obj.remove_region(region),
            Self::Contiguous(obj) => obj.remove_region(region),
        }
    }

    /// The frame to install for slot `index`, if backed.
    pub(crate) fn slot_mapping(&self, index: usize) -> Option<SlotMapping> {
        match self {
            Self::Anonymous(obj) => obj.slot_mapping(index),
            Self::Contiguous(obj) => obj.paddr(index).map(|paddr| SlotMapping { paddr, cow: false }),
        }
    }

    /// Pages of `[first, first + count)` currently backed.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if the range leaves the object.
    pub fn resident_pages(&self, first: usize, count: usize) -> Result<usize, VmError> {
        match self {
            Self::Anonymous(obj) => obj.resident_pages(first, count),
            Self::Contiguous(obj) => obj.check_window(first, count).map(|()| count),
        }
    }

    /// Pages of `[first, first + count)` whose frame is shared with another
    /// object.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if the range leaves the object.
    pub fn shared_pages(&self, first: usize, count: usize) -> Result<usize, VmError> {
        match self {
            Self::Anonymous(obj) => obj.shared_pages(first, count),
            Self::Contiguous(obj) => obj.check_window(first, count).map(|()| 0),
        }
    }

    /// Pages still marked copy-on-write.
    pub fn cow_pages(&self) -> usize {
        self.as_anonymous().map_or(0, AnonymousVmObject::cow_pages)
    }
}
