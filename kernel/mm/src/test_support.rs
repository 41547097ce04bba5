//! Host-side stand-ins for physical memory and page tables.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_core::PAGE_SIZE;
use kestrel_core::addr::{PhysAddr, VirtAddr};

use crate::config::MmConfig;
use crate::hhdm::Hhdm;
use crate::manager::MemoryManager;
use crate::mapper::{MapError, MapFlags, MapFlush, PageTable, UnmapError};
use crate::physical::PhysicalRegion;
use crate::pmm::Pmm;

/// Fake physical address of the first buffer frame.
pub const PHYS_BASE: u64 = 0x10_0000;

/// A page-aligned heap buffer posing as physical memory at [`PHYS_BASE`].
pub struct FrameBuffer {
    ptr: *mut u8,
    layout: Layout,
    frames: usize,
}

// SAFETY: The buffer is plain memory owned by this value.
unsafe impl Send for FrameBuffer {}
// SAFETY: See above; all access goes through raw pointers under test control.
unsafe impl Sync for FrameBuffer {}

impl FrameBuffer {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: `frames` is non-zero in every test, so the layout is too.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "test buffer allocation failed");
        Self { ptr, layout, frames }
    }

    /// HHDM under which `frame(i)` lands on buffer page `i`.
    pub fn hhdm(&self) -> Hhdm {
        Hhdm::new((self.ptr as u64).wrapping_sub(PHYS_BASE))
    }

    /// Fake physical address of buffer page `index` (may be one past the end).
    pub fn frame(&self, index: usize) -> PhysAddr {
        PhysAddr::new(PHYS_BASE + (index * PAGE_SIZE) as u64)
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with this layout.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A [`Pmm`] over a single [`FrameBuffer`] region.
///
/// Field order matters: the allocator (and every page still referring to
/// it) must go before the buffer.
pub struct TestMemory {
    pmm: Arc<Pmm>,
    _buffer: FrameBuffer,
}

impl TestMemory {
    pub fn new(frames: usize) -> Self {
        let buffer = FrameBuffer::new(frames);
        let mut region = PhysicalRegion::new(buffer.frame(0), buffer.frame(frames), buffer.hhdm());
        region.initialize_zones().unwrap();
        // SAFETY: The region is exactly the buffer, reachable through its HHDM.
        let pmm = unsafe { Pmm::from_regions(vec![region], buffer.hhdm()) };
        Self {
            pmm: Arc::new(pmm),
            _buffer: buffer,
        }
    }

    pub fn pmm(&self) -> Arc<Pmm> {
        Arc::clone(&self.pmm)
    }

    /// A manager using this memory and the default configuration.
    pub fn manager(&self) -> MemoryManager {
        MemoryManager::from_pmm(self.pmm(), MmConfig::default())
    }
}

/// A page table kept in a map, for driving regions without hardware.
#[derive(Debug, Default)]
pub struct SoftPageTable {
    entries: BTreeMap<u64, (PhysAddr, MapFlags)>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// SAFETY: Translations are only recorded, never walked by hardware.
unsafe impl PageTable for SoftPageTable {
    fn map(&mut self, page: VirtAddr, frame: PhysAddr, flags: MapFlags) -> Result<MapFlush, MapError> {
        if self.entries.contains_key(&page.as_u64()) {
            return Err(MapError::AlreadyMapped);
        }
        self.entries.insert(page.as_u64(), (frame, flags));
        Ok(MapFlush::new(page))
    }

    fn unmap(&mut self, page: VirtAddr) -> Result<(PhysAddr, MapFlush), UnmapError> {
        let (frame, _) = self.entries.remove(&page.as_u64()).ok_or(UnmapError::NotMapped)?;
        Ok((frame, MapFlush::new(page)))
    }

    fn update_flags(&mut self, page: VirtAddr, flags: MapFlags) -> Result<MapFlush, UnmapError> {
        let entry = self.entries.get_mut(&page.as_u64()).ok_or(UnmapError::NotMapped)?;
        entry.1 = flags;
        Ok(MapFlush::new(page))
    }

    fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, MapFlags)> {
        self.entries.get(&virt.page_base().as_u64()).copied()
    }
}
