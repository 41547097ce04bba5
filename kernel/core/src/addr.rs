//! Typed virtual and physical address wrappers.
//!
//! [`VirtAddr`] and [`PhysAddr`] keep the two address spaces apart at the type
//! level. Both carry page-granular helpers since the memory manager works
//! almost exclusively in whole pages.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// A canonical 64-bit virtual address (sign-extended from bit 47).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A 64-bit physical address (masked to 52 bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE as u64 - 1;

impl VirtAddr {
    /// Creates a new `VirtAddr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not canonical.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(canonical.0 == addr, "VirtAddr::new: address is not canonical");
        canonical
    }

    /// Creates a new `VirtAddr`, sign-extending bit 47 into the upper bits.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(((addr << 16) as i64 >> 16) as u64)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Returns `true` if the address sits on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }

    /// Rounds the address down to the containing page.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self::new_truncate(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the address `count` pages above this one.
    #[inline]
    pub const fn offset_pages(self, count: usize) -> Self {
        Self::new_truncate(self.0.wrapping_add((count as u64) << PAGE_SHIFT))
    }

    /// Returns the number of whole pages between `base` and `self`.
    ///
    /// `self` must not be below `base`.
    #[inline]
    pub const fn pages_from(self, base: VirtAddr) -> usize {
        debug_assert!(self.0 >= base.0, "pages_from: address below base");
        ((self.0 - base.0) >> PAGE_SHIFT) as usize
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_add(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Creates a new `PhysAddr`. Debug-panics if bits above 52 are set.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let masked = addr & PHYS_ADDR_MASK;
        debug_assert!(
            masked == addr,
            "PhysAddr::new: address exceeds 52-bit physical address space"
        );
        Self(masked)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address sits on a frame boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }

    /// Rounds the address down to a frame boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    /// Rounds the address up to a frame boundary.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK)
    }

    /// Returns the address `count` frames above this one.
    #[inline]
    pub const fn offset_pages(self, count: usize) -> Self {
        Self::new(self.0 + ((count as u64) << PAGE_SHIFT))
    }

    /// Returns the number of whole frames between `base` and `self`.
    #[inline]
    pub const fn pages_from(self, base: PhysAddr) -> usize {
        debug_assert!(self.0 >= base.0, "pages_from: address below base");
        ((self.0 - base.0) >> PAGE_SHIFT) as usize
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_truncate_high_half() {
        let addr = VirtAddr::new_truncate(0x0000_8000_0000_0000);
        assert_eq!(addr.as_u64(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn virt_addr_page_helpers() {
        let addr = VirtAddr::new(0x40_1234);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.page_base().as_u64(), 0x40_1000);
        assert_eq!(addr.page_offset(), 0x234);
        assert_eq!(addr.page_base().offset_pages(3).as_u64(), 0x40_4000);
    }

    #[test]
    fn virt_addr_pages_from() {
        let base = VirtAddr::new(0x40_0000);
        assert_eq!(VirtAddr::new(0x40_5fff).pages_from(base), 5);
        assert_eq!(base.pages_from(base), 0);
    }

    #[test]
    fn phys_addr_alignment() {
        let addr = PhysAddr::new(0x3456);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.page_align_down().as_u64(), 0x3000);
        assert_eq!(addr.page_align_up().as_u64(), 0x4000);
        assert_eq!(PhysAddr::new(0x4000).page_align_up().as_u64(), 0x4000);
    }

    #[test]
    fn phys_addr_frame_arithmetic() {
        let base = PhysAddr::new(0x10_0000);
        let addr = base.offset_pages(7);
        assert_eq!(addr.as_u64(), 0x10_7000);
        assert_eq!(addr.pages_from(base), 7);
        assert_eq!(addr - base, 0x7000);
    }
}
