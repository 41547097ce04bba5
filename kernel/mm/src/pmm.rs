//! Physical memory manager: the user physical regions, commit accounting and
//! frame access through the direct map.
//!
//! Frames are handed out in two flavours. *Uncommitted* allocations
//! ([`Pmm::allocate_page`]) may fail at any time, but never dig into frames
//! promised to a commitment. *Committed* allocations go through a
//! [`CommittedPages`] token obtained up front with [`Pmm::commit`] and can
//! only fail if the accounting itself is broken.
//!
//! The ledger invariant is `free_frames >= committed`: frees only grow the
//! left side and every allocation checks it under the ledger lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_core::addr::PhysAddr;
use kestrel_core::sync::SpinLock;
use kestrel_core::{kerr, kinfo, kwarn};

use crate::config::MmConfig;
use crate::hhdm::Hhdm;
use crate::physical::{PhysicalPage, PhysicalRegion};
use crate::{PAGE_SIZE, PhysMemoryRegion, PmmError};

/// Whether a freshly allocated frame must be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    /// Leave the previous contents (the caller overwrites the frame).
    No,
    /// Clear the frame before handing it out.
    Yes,
}

/// Snapshot of the physical memory counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemoryInfo {
    /// Frames managed by the allocator.
    pub total_frames: usize,
    /// Frames not currently allocated.
    pub free_frames: usize,
    /// Free frames promised to outstanding commitments.
    pub committed_frames: usize,
    /// Free frames available to uncommitted allocations.
    pub uncommitted_frames: usize,
}

struct Ledger {
    committed: usize,
}

/// The physical memory manager.
pub struct Pmm {
    regions: Vec<Arc<PhysicalRegion>>,
    hhdm: Hhdm,
    total_frames: usize,
    ledger: SpinLock<Ledger>,
}

impl Pmm {
    /// Builds the allocator from zone-initialised regions.
    ///
    /// # Safety
    ///
    /// Every frame of every region must be unused RAM reachable through
    /// `hhdm`, and no two regions may overlap.
    pub unsafe fn from_regions(regions: Vec<PhysicalRegion>, hhdm: Hhdm) -> Self {
        let total_frames = regions.iter().map(PhysicalRegion::free_count).sum();
        Self {
            regions: regions.into_iter().map(Arc::new).collect(),
            hhdm,
            total_frames,
            ledger: SpinLock::named("CommitLedger", Ledger { committed: 0 }),
        }
    }

    /// Parses a bootloader memory map into page-aligned physical regions and
    /// carves their zones.
    ///
    /// Non-usable entries (firmware, the kernel image, boot modules) are cut
    /// out of any usable entry they overlap. Adjacent usable runs are merged
    /// and runs shorter than `config.min_region_frames` are dropped. If
    /// `config.bootstrap_frames` is non-zero, that many frames are split off
    /// the front of the first region large enough and returned separately
    /// for early-boot allocators.
    ///
    /// # Errors
    ///
    /// [`PmmError::NoUsableMemory`] if no region survives.
    ///
    /// # Safety
    ///
    /// `map` must describe physical memory accurately and `hhdm` must map
    /// all of it.
    pub unsafe fn from_memory_map(
        map: &[PhysMemoryRegion],
        config: &MmConfig,
        hhdm: Hhdm,
    ) -> Result<(Self, Option<PhysicalRegion>), PmmError> {
        let mut runs = usable_runs(map);
        runs.retain(|&(start, end)| end.pages_from(start) >= config.min_region_frames);

        let mut bootstrap = None;
        let mut regions = Vec::with_capacity(runs.len());
        for (start, end) in runs {
            let mut region = PhysicalRegion::new(start, end, hhdm);
            if bootstrap.is_none() && config.bootstrap_frames > 0 {
                bootstrap = region.try_take_pages_from_beginning(config.bootstrap_frames);
                if let Some(boot) = &bootstrap {
                    kinfo!(
                        "MM: bootstrap region {}-{} ({} frames)",
                        boot.lower(),
                        boot.upper(),
                        boot.size()
                    );
                }
            }
            match region.initialize_zones_with(config.zone_sizes) {
                Ok(()) => {
                    kinfo!(
                        "MM: user physical region {}-{} ({} KiB)",
                        region.lower(),
                        region.upper(),
                        region.size() * PAGE_SIZE / 1024
                    );
                    regions.push(region);
                }
                Err(err) => kwarn!(
                    "MM: dropping region {}-{}: {}",
                    region.lower(),
                    region.upper(),
                    err
                ),
            }
        }

        if regions.is_empty() {
            return Err(PmmError::NoUsableMemory);
        }
        // SAFETY: The regions come from the caller's accurate memory map with
        // reserved ranges removed; `usable_runs` never produces overlaps.
        let pmm = unsafe { Self::from_regions(regions, hhdm) };
        kinfo!(
            "MM: {} regions, {} frames ({} KiB) available",
            pmm.regions.len(),
            pmm.total_frames,
            pmm.total_frames * PAGE_SIZE / 1024
        );
        Ok((pmm, bootstrap))
    }

    /// The user physical regions, in address order.
    pub fn regions(&self) -> &[Arc<PhysicalRegion>] {
        &self.regions
    }

    /// The direct-map translation used for frame access.
    pub fn hhdm(&self) -> Hhdm {
        self.hhdm
    }

    /// Total frames managed.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Frames currently free in all regions.
    pub fn free_frames(&self) -> usize {
        self.regions.iter().map(|r| r.free_count()).sum()
    }

    /// Current counters.
    pub fn stats(&self) -> SystemMemoryInfo {
        let ledger = self.ledger.lock();
        let free_frames = self.free_frames();
        SystemMemoryInfo {
            total_frames: self.total_frames,
            free_frames,
            committed_frames: ledger.committed,
            uncommitted_frames: free_frames.saturating_sub(ledger.committed),
        }
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Reserves `count` frames for later committed allocation.
    ///
    /// # Errors
    ///
    /// [`PmmError::CapacityExhausted`] if fewer than `count` frames are
    /// neither allocated nor already committed.
    pub fn commit(self: &Arc<Self>, count: usize) -> Result<CommittedPages, PmmError> {
        let mut ledger = self.ledger.lock();
        if self.free_frames().saturating_sub(ledger.committed) < count {
            return Err(PmmError::CapacityExhausted);
        }
        ledger.committed += count;
        Ok(CommittedPages {
            remaining: count,
            pmm: Arc::clone(self),
        })
    }

    fn uncommit(&self, count: usize) {
        let mut ledger = self.ledger.lock();
        debug_assert!(ledger.committed >= count, "uncommit underflow");
        ledger.committed -= count;
    }

    /// Allocates one frame outside any commitment. Regions are tried in
    /// order; the first with a free frame wins.
    ///
    /// # Errors
    ///
    /// [`PmmError::CapacityExhausted`] if every uncommitted frame is in use.
    pub fn allocate_page(&self, fill: ShouldZeroFill) -> Result<PhysicalPage, PmmError> {
        let page = {
            let ledger = self.ledger.lock();
            if self.free_frames() <= ledger.committed {
                return Err(PmmError::CapacityExhausted);
            }
            self.take_from_any_region()?
        };
        self.apply_fill(&page, fill);
        Ok(page)
    }

    /// Allocates `count` physically contiguous frames (never across zones).
    ///
    /// # Errors
    ///
    /// [`PmmError::InvalidRequest`] for `count == 0`,
    /// [`PmmError::CapacityExhausted`] if no zone holds a long enough run.
    pub fn allocate_contiguous(
        &self,
        count: usize,
        fill: ShouldZeroFill,
    ) -> Result<Vec<PhysicalPage>, PmmError> {
        if count == 0 {
            return Err(PmmError::InvalidRequest);
        }
        let pages = {
            let ledger = self.ledger.lock();
            if self.free_frames().saturating_sub(ledger.committed) < count {
                return Err(PmmError::CapacityExhausted);
            }
            self.regions
                .iter()
                .find_map(|region| region.take_contiguous_free_pages(count).ok())
                .ok_or(PmmError::CapacityExhausted)?
        };
        for page in &pages {
            self.apply_fill(page, fill);
        }
        Ok(pages)
    }

    fn take_from_any_region(&self) -> Result<PhysicalPage, PmmError> {
        for region in &self.regions {
            match region.take_free_page() {
                Ok(page) => return Ok(page),
                Err(PmmError::CapacityExhausted) => {}
                Err(err) => return Err(err),
            }
        }
        Err(PmmError::CapacityExhausted)
    }

    fn apply_fill(&self, page: &PhysicalPage, fill: ShouldZeroFill) {
        if fill == ShouldZeroFill::Yes {
            // SAFETY: The page was just allocated; nobody else holds it.
            unsafe { self.hhdm.zero_frame(page.paddr()) };
        }
    }

    // -----------------------------------------------------------------------
    // Frame access
    // -----------------------------------------------------------------------

    /// Copies the contents of `src` into `dst`.
    pub(crate) fn copy_page(&self, src: &PhysicalPage, dst: &PhysicalPage) {
        debug_assert_eq!(dst.ref_count(), 1, "copy_page into a shared frame");
        // SAFETY: Both frames belong to this allocator and are mapped by the
        // direct map; `dst` is exclusively owned.
        unsafe { self.hhdm.copy_frame(src.paddr(), dst.paddr()) };
    }

    /// Reads bytes from a frame owned by this allocator.
    ///
    /// # Panics
    ///
    /// Panics if `offset + buf.len()` exceeds the page or if the frame does
    /// not belong to this allocator.
    pub fn read_page(&self, page: &PhysicalPage, offset: usize, buf: &mut [u8]) {
        assert!(self.owns(page.paddr()), "read_page: foreign frame {}", page.paddr());
        // SAFETY: Every frame handed out by this allocator is reachable
        // through its direct map (construction contract).
        unsafe { self.hhdm.read(page.paddr(), offset, buf) };
    }

    /// Writes bytes into a frame owned by this allocator.
    ///
    /// # Panics
    ///
    /// Panics if `offset + data.len()` exceeds the page or if the frame
    /// does not belong to this allocator.
    pub fn write_page(&self, page: &PhysicalPage, offset: usize, data: &[u8]) {
        assert!(self.owns(page.paddr()), "write_page: foreign frame {}", page.paddr());
        // SAFETY: As in `read_page`.
        unsafe { self.hhdm.write(page.paddr(), offset, data) };
    }

    /// Returns `true` if `addr` belongs to one of the user regions.
    pub fn owns(&self, addr: PhysAddr) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }
}

impl core::fmt::Debug for Pmm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmm")
            .field("regions", &self.regions.len())
            .field("total_frames", &self.total_frames)
            .finish_non_exhaustive()
    }
}

/// Frames reserved for one owner, allocated on demand.
///
/// Dropping the token returns whatever was not used to the uncommitted pool.
pub struct CommittedPages {
    remaining: usize,
    pmm: Arc<Pmm>,
}

impl CommittedPages {
    /// Frames still reserved.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Allocates one of the reserved frames.
    ///
    /// # Errors
    ///
    /// [`PmmError::CapacityExhausted`] if the token is used up. A failure
    /// with reservations left means the ledger is corrupt and is logged.
    pub fn take(&mut self, fill: ShouldZeroFill) -> Result<PhysicalPage, PmmError> {
        if self.remaining == 0 {
            return Err(PmmError::CapacityExhausted);
        }
        let page = {
            let mut ledger = self.pmm.ledger.lock();
            ledger.committed -= 1;
            self.remaining -= 1;
            self.pmm.take_from_any_region()
        };
        let page = page.inspect_err(|err| {
            kerr!("MM: committed allocation failed: {}", err);
        })?;
        self.pmm.apply_fill(&page, fill);
        Ok(page)
    }
}

impl Drop for CommittedPages {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.pmm.uncommit(self.remaining);
        }
    }
}

impl core::fmt::Debug for CommittedPages {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommittedPages")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Memory map parsing
// ---------------------------------------------------------------------------

/// Page-aligned usable runs with reserved ranges removed, sorted and merged.
fn usable_runs(map: &[PhysMemoryRegion]) -> Vec<(PhysAddr, PhysAddr)> {
    let mut runs: Vec<(PhysAddr, PhysAddr)> = Vec::new();
    for entry in map.iter().filter(|e| e.usable) {
        let start = entry.start.page_align_up();
        let end = (entry.start + entry.size).page_align_down();
        if start >= end {
            continue;
        }
        let mut pieces = alloc::vec![(start, end)];
        for reserved in map.iter().filter(|e| !e.usable && e.size > 0) {
            let r_start = reserved.start.page_align_down();
            let r_end = (reserved.start + reserved.size).page_align_up();
            pieces = pieces
                .into_iter()
                .flat_map(|(s, e)| {
                    let below = (s, e.min(r_start));
                    let above = (s.max(r_end), e);
                    [below, above]
                })
                .filter(|&(s, e)| s < e)
                .collect();
        }
        runs.extend(pieces);
    }

    runs.sort_unstable_by_key(|&(start, _)| start);
    let mut merged: Vec<(PhysAddr, PhysAddr)> = Vec::with_capacity(runs.len());
    for (start, end) in runs {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}
