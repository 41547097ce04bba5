//! Virtual memory core of the Kestrel kernel.
//!
//! Layers, bottom-up:
//!
//! - [`physical`]: frame zones, physical regions and refcounted
//!   [`PhysicalPage`](physical::PhysicalPage) handles.
//! - [`pmm`]: the user physical regions plus commit accounting.
//! - [`vm`]: VM objects (anonymous with copy-on-write and purgeable ranges,
//!   physically contiguous for DMA).
//! - [`region`] and [`address_space`]: mappings of objects into page tables.
//! - [`fault`]: the page-fault resolution protocol.
//! - [`manager`]: the [`MemoryManager`](manager::MemoryManager) context the
//!   rest of the kernel talks to.
//!
//! Everything above the page-table trait is architecture independent and
//! runs under `cargo test` on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
mod bitmap;
pub mod config;
pub mod fault;
pub mod hhdm;
pub mod manager;
pub mod mapper;
pub mod physical;
pub mod pmm;
pub mod range;
pub mod region;
pub mod vm;

#[cfg(test)]
pub(crate) mod test_support;

use core::fmt;

pub use kestrel_core::PAGE_SIZE;
use kestrel_core::addr::PhysAddr;

/// A physical memory map entry, independent of bootloader types.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Physical start address of the entry.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Whether this entry is usable RAM.
    pub usable: bool,
}

/// Physical allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No free frame is available for this request.
    CapacityExhausted,
    /// The frame address is outside the allocator or not allocated.
    InvalidFrame,
    /// The request itself is malformed (zero-length run, region too small).
    InvalidRequest,
    /// Zones were already carved out of this region.
    ZonesInitialized,
    /// The memory map contains no usable RAM.
    NoUsableMemory,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmmError::CapacityExhausted => write!(f, "out of physical memory"),
            PmmError::InvalidFrame => write!(f, "invalid frame address"),
            PmmError::InvalidRequest => write!(f, "invalid allocation request"),
            PmmError::ZonesInitialized => write!(f, "zones already initialized"),
            PmmError::NoUsableMemory => write!(f, "no usable physical memory"),
        }
    }
}

/// Virtual memory errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Physical memory, a commitment or free virtual space ran out.
    CapacityExhausted,
    /// A page index past the end of a VM object.
    OutOfBoundsAccess,
    /// The access is not permitted by the region or page protection.
    ProtectionViolation,
    /// Access to a purged page whose range was made non-volatile again
    /// without repopulating it.
    StaleVolatileAccess,
    /// Unaligned, empty or overlapping virtual range.
    InvalidRange,
    /// The region has no purgeable registration.
    NotPurgeable,
    /// No region at the given address.
    NoSuchRegion,
    /// No address space with the given id.
    NoSuchAddressSpace,
    /// Installing a translation failed in the page-table backend.
    MapFailed,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::CapacityExhausted => write!(f, "out of physical memory"),
            VmError::OutOfBoundsAccess => write!(f, "page index out of bounds"),
            VmError::ProtectionViolation => write!(f, "protection violation"),
            VmError::StaleVolatileAccess => write!(f, "access to purged non-volatile page"),
            VmError::InvalidRange => write!(f, "invalid virtual range"),
            VmError::NotPurgeable => write!(f, "region is not purgeable"),
            VmError::NoSuchRegion => write!(f, "no such region"),
            VmError::NoSuchAddressSpace => write!(f, "no such address space"),
            VmError::MapFailed => write!(f, "page table update failed"),
        }
    }
}

impl From<PmmError> for VmError {
    fn from(err: PmmError) -> Self {
        match err {
            PmmError::CapacityExhausted | PmmError::NoUsableMemory => VmError::CapacityExhausted,
            PmmError::InvalidFrame | PmmError::InvalidRequest | PmmError::ZonesInitialized => {
                VmError::InvalidRange
            }
        }
    }
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: u64) -> usize {
    bytes.div_ceil(PAGE_SIZE as u64) as usize
}
