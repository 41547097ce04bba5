//! Architecture-independent page-table interface.
//!
//! Regions talk to the hardware only through the [`PageTable`] trait, one
//! instance per address space. The architecture backend owns the root table
//! and the frames for intermediate levels.
//!
//! # TLB Flush Decoupling
//!
//! The architecture-specific single-page invalidation is registered at boot
//! via [`register_tlb_flush`]. Until then flushes are no-ops, which is also
//! what host tests run with.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use kestrel_core::addr::{PhysAddr, VirtAddr};

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable (if unset, no-execute is implied).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Caching disabled for this page.
        const CACHE_DISABLE = 1 << 3;
    }
}

/// Error from [`PageTable::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A frame for an intermediate table could not be allocated.
    TableAllocationFailed,
    /// The page already has a translation.
    AlreadyMapped,
}

/// Error from [`PageTable::unmap`] and [`PageTable::update_flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
    /// The entry maps a larger page than the 4 KiB one requested.
    SizeMismatch,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableAllocationFailed => write!(f, "page table allocation failed"),
            Self::AlreadyMapped => write!(f, "page already mapped"),
        }
    }
}

impl fmt::Display for UnmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "page not mapped"),
            Self::SizeMismatch => write!(f, "page size mismatch"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registered TLB flush callback
// ---------------------------------------------------------------------------

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture-specific TLB flush function.
///
/// On x86_64 this is `invlpg`. Must be called before the first user
/// mapping is changed.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: The pointer was stored by `register_tlb_flush` from a valid
    // `fn(VirtAddr)`, or is the initial `nop_flush`.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

// ---------------------------------------------------------------------------
// MapFlush
// ---------------------------------------------------------------------------

/// A pending TLB flush for a single page.
///
/// Flushes on drop unless [`.flush()`](Self::flush) or
/// [`.ignore()`](Self::ignore) is called first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a pending flush for `virt`.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// The page this flush targets.
    pub fn virt(&self) -> VirtAddr {
        self.virt
    }

    /// Flushes the TLB entry now.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Skips the flush (fresh mappings that cannot be cached yet).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}

impl fmt::Debug for MapFlush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapFlush")
            .field("virt", &self.virt)
            .field("needs_flush", &self.needs_flush)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PageTable
// ---------------------------------------------------------------------------

/// The translation table of one address space, 4 KiB granularity.
///
/// # Safety
///
/// Implementations must install exactly the translations requested and must
/// not keep references to frames after [`unmap`](Self::unmap) returns them.
/// The memory manager relies on this to free frames once every translation
/// is gone.
pub unsafe trait PageTable: Send {
    /// Maps `page` to `frame` with `flags`.
    fn map(&mut self, page: VirtAddr, frame: PhysAddr, flags: MapFlags)
    -> Result<MapFlush, MapError>;

    /// Removes the translation of `page`, returning the frame it pointed to.
    fn unmap(&mut self, page: VirtAddr) -> Result<(PhysAddr, MapFlush), UnmapError>;

    /// Replaces the flags of a mapped page.
    fn update_flags(&mut self, page: VirtAddr, flags: MapFlags) -> Result<MapFlush, UnmapError>;

    /// Looks up the translation of the page containing `virt`.
    fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn mapflags_all_bits_distinct() {
        let all = [
            MapFlags::WRITABLE,
            MapFlags::EXECUTABLE,
            MapFlags::USER,
            MapFlags::CACHE_DISABLE,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                if i != j {
                    assert!((*a & *b).is_empty(), "{a:?} and {b:?} share bits");
                }
            }
        }
    }

    static FLUSHES: AtomicUsize = AtomicUsize::new(0);

    fn counting_flush(_virt: VirtAddr) {
        FLUSHES.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn map_flush_flushes_once() {
        register_tlb_flush(counting_flush);
        let before = FLUSHES.load(Ordering::Relaxed);

        MapFlush::new(VirtAddr::new(0x1000)).flush();
        MapFlush::new(VirtAddr::new(0x2000)).ignore();
        drop(MapFlush::new(VirtAddr::new(0x3000)));

        // Other tests may flush concurrently through the same hook.
        assert!(FLUSHES.load(Ordering::Relaxed) >= before + 2);
        register_tlb_flush(nop_flush);
    }
}
