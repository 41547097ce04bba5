//! Anonymous memory: zero-filled on first touch, copy-on-write across fork,
//! optionally purgeable.
//!
//! All per-page state (slots, COW bits, purged bits, commitments and the
//! purgeable registrations) sits behind a single object lock, so lazy
//! commit, COW resolution and purging of the same page are serialised.

use alloc::vec;
use alloc::vec::Vec;

use alloc::sync::Arc;

use kestrel_core::PAGE_SIZE;
use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::sync::SpinLock;
use kestrel_core::{kdebug, ktrace};

use super::purgeable::VolatilePageRanges;
use crate::address_space::{AddressSpaceId, RegionRef};
use crate::bitmap::Bitmap;
use crate::physical::PhysicalPage;
use crate::pmm::{CommittedPages, Pmm, ShouldZeroFill};
use crate::VmError;

/// When frames backing an anonymous object are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Allocate and zero every page at creation.
    AllocateNow,
    /// Commit every page at creation, allocate on first touch.
    Reserve,
    /// Allocate on first touch; the fault may run out of memory.
    None,
}

/// Outcome of [`AnonymousVmObject::handle_cow_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowResolution {
    /// The page had no other sharer and is now private in place.
    Reused(PhysAddr),
    /// The page was copied into a fresh private frame.
    Copied(PhysAddr),
}

impl CowResolution {
    /// Frame now backing the page.
    pub fn paddr(self) -> PhysAddr {
        match self {
            Self::Reused(addr) | Self::Copied(addr) => addr,
        }
    }
}

/// A backed slot as seen by the mapping code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotMapping {
    pub paddr: PhysAddr,
    /// Must be mapped read-only until a write fault resolves the COW.
    pub cow: bool,
}

/// Outcome of committing an unbacked slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commit {
    /// The slot was already backed; only the translation was missing.
    Present(SlotMapping),
    /// A zero-filled frame was installed.
    Allocated(PhysAddr),
}

/// Pages taken out of an object by [`AnonymousVmObject::purge`].
///
/// The frames are released when this value is dropped. Callers must remove
/// the translations of every page in every listed region first.
#[derive(Debug, Default)]
pub struct PurgedPages {
    pages: Vec<(usize, PhysicalPage)>,
    regions: Vec<RegionRef>,
}

impl PurgedPages {
    /// Number of pages reclaimed.
    pub fn count(&self) -> usize {
        self.pages.len()
    }

    /// Object page indices that were purged.
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.iter().map(|(index, _)| *index)
    }

    /// Regions that may hold translations of the purged pages.
    pub fn regions(&self) -> &[RegionRef] {
        &self.regions
    }
}

struct Registration {
    owner: RegionRef,
    volatile: VolatilePageRanges,
}

struct AnonymousInner {
    slots: Vec<Option<PhysicalPage>>,
    regions: Vec<RegionRef>,
    cow: Bitmap,
    purged: Bitmap,
    committed: Option<CommittedPages>,
    purgeable: Vec<Registration>,
}

impl AnonymousInner {
    fn is_volatile(&self, index: usize) -> bool {
        !self.purgeable.is_empty() && self.purgeable.iter().all(|r| r.volatile.contains(index))
    }

    fn registration_mut(&mut self, owner: RegionRef) -> Result<&mut Registration, VmError> {
        self.purgeable
            .iter_mut()
            .find(|r| r.owner == owner)
            .ok_or(VmError::NotPurgeable)
    }

    fn allocate_private(&mut self, pmm: &Pmm) -> Result<PhysicalPage, VmError> {
        match self.committed.as_mut() {
            Some(committed) if committed.remaining() > 0 => {
                Ok(committed.take(ShouldZeroFill::Yes)?)
            }
            _ => Ok(pmm.allocate_page(ShouldZeroFill::Yes)?),
        }
    }
}

/// Anonymous VM object.
pub struct AnonymousVmObject {
    page_count: usize,
    purgeable: bool,
    inner: SpinLock<AnonymousInner>,
}

impl AnonymousVmObject {
    /// Creates an object of `page_count` pages.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidRange`] for zero pages, [`VmError::CapacityExhausted`]
    /// if the strategy needs more frames than are available.
    pub fn try_create(
        pmm: &Arc<Pmm>,
        page_count: usize,
        strategy: AllocationStrategy,
        purgeable: bool,
    ) -> Result<Self, VmError> {
        if page_count == 0 {
            return Err(VmError::InvalidRange);
        }
        let (slots, committed) = match strategy {
            AllocationStrategy::AllocateNow => {
                let mut committed = pmm.commit(page_count)?;
                let slots = (0..page_count)
                    .map(|_| committed.take(ShouldZeroFill::Yes).map(Some))
                    .collect::<Result<Vec<_>, _>>()?;
                (slots, None)
            }
            AllocationStrategy::Reserve => (vec![None; page_count], Some(pmm.commit(page_count)?)),
            AllocationStrategy::None => (vec![None; page_count], None),
        };
        Ok(Self::from_parts(page_count, purgeable, slots, committed))
    }

    /// Creates a fully backed object over frames the caller already holds.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidRange`] if `pages` is empty.
    pub fn try_create_with_physical_pages(pages: Vec<PhysicalPage>) -> Result<Self, VmError> {
        if pages.is_empty() {
            return Err(VmError::InvalidRange);
        }
        let page_count = pages.len();
        let slots = pages.into_iter().map(Some).collect();
        Ok(Self::from_parts(page_count, false, slots, None))
    }

    /// Creates an object over `page_count` frames of physical memory the
    /// allocator does not manage, starting at `base` (device memory, boot
    /// tables). The frames are never returned to a free list.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidRange`] for zero pages, an unaligned or
    /// overflowing range, or one that overlaps allocator memory.
    pub fn try_create_for_physical_range(
        pmm: &Pmm,
        base: PhysAddr,
        page_count: usize,
    ) -> Result<Self, VmError> {
        let end = page_count
            .checked_mul(PAGE_SIZE)
            .and_then(|size| base.as_u64().checked_add(size as u64));
        if page_count == 0 || !base.is_page_aligned() || end.is_none() {
            return Err(VmError::InvalidRange);
        }
        let frames: Vec<PhysAddr> = (0..page_count).map(|i| base.offset_pages(i)).collect();
        if frames.iter().any(|&frame| pmm.owns(frame)) {
            return Err(VmError::InvalidRange);
        }
        let slots = frames.into_iter().map(|frame| Some(PhysicalPage::unmanaged(frame))).collect();
        Ok(Self::from_parts(page_count, false, slots, None))
    }

    fn from_parts(
        page_count: usize,
        purgeable: bool,
        slots: Vec<Option<PhysicalPage>>,
        committed: Option<CommittedPages>,
    ) -> Self {
        Self {
            page_count,
            purgeable,
            inner: SpinLock::named(
                "AnonymousVmObject",
                AnonymousInner {
                    slots,
                    regions: Vec::new(),
                    cow: Bitmap::new(page_count),
                    purged: Bitmap::new(page_count),
                    committed,
                    purgeable: Vec::new(),
                },
            ),
        }
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Whether the object accepts volatile ranges.
    pub fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    fn check_index(&self, index: usize) -> Result<(), VmError> {
        if index < self.page_count {
            Ok(())
        } else {
            Err(VmError::OutOfBoundsAccess)
        }
    }

    /// Returns a handle to the page in slot `index`, if backed.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if `index >= page_count`.
    pub fn physical_page(&self, index: usize) -> Result<Option<PhysicalPage>, VmError> {
        self.check_index(index)?;
        Ok(self.inner.lock().slots[index].clone())
    }

    /// Reference count of the page in slot `index`, if backed.
    pub fn page_ref_count(&self, index: usize) -> Result<Option<usize>, VmError> {
        self.check_index(index)?;
        Ok(self.inner.lock().slots[index].as_ref().map(PhysicalPage::ref_count))
    }

    /// Whether slot `index` is marked copy-on-write.
    pub fn is_cow(&self, index: usize) -> Result<bool, VmError> {
        self.check_index(index)?;
        Ok(self.inner.lock().cow.get(index))
    }

    /// Number of pages still waiting for a COW copy.
    pub fn cow_pages(&self) -> usize {
        self.inner.lock().cow.count_ones()
    }

    /// Number of backed slots in `[first, first + count)`.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if the range leaves the object.
    pub fn resident_pages(&self, first: usize, count: usize) -> Result<usize, VmError> {
        self.check_window(first, count)?;
        let inner = self.inner.lock();
        Ok(inner.slots[first..first + count].iter().flatten().count())
    }

    /// Number of backed slots in `[first, first + count)` whose frame is
    /// shared with another object.
    ///
    /// # Errors
    ///
    /// [`VmError::OutOfBoundsAccess`] if the range leaves the object.
    pub fn shared_pages(&self, first: usize, count: usize) -> Result<usize, VmError> {
        self.check_window(first, count)?;
        let inner = self.inner.lock();
        Ok(inner.slots[first..first + count]
            .iter()
            .flatten()
            .filter(|p| p.ref_count() > 1)
            .count())
    }

    /// Frames still reserved by this object's commitment.
    pub fn committed_pages(&self) -> usize {
        self.inner
            .lock()
            .committed
            .as_ref()
            .map_or(0, CommittedPages::remaining)
    }

    pub(crate) fn slot_mapping(&self, index: usize) -> Option<SlotMapping> {
        let inner = self.inner.lock();
        inner.slots.get(index)?.as_ref().map(|page| SlotMapping {
            paddr: page.paddr(),
            cow: inner.cow.get(index),
        })
    }

    // -----------------------------------------------------------------------
    // Region set
    // -----------------------------------------------------------------------

    pub(crate) fn add_region(&self, region: RegionRef) {
        self.inner.lock().regions.push(region);
    }

    pub(crate) fn remove_region(&self, region: RegionRef) {
        self.inner.lock().regions.retain(|r| *r != region);
    }

    pub(crate) fn for_each_region(&self, mut f: impl FnMut(RegionRef)) {
        for region in &self.inner.lock().regions {
            f(*region);
        }
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    /// Backs slot `index` with a zero-filled frame if it is empty.
    ///
    /// The frame comes from the object's commitment while one remains and
    /// from the uncommitted pool otherwise.
    pub(crate) fn commit_page(&self, pmm: &Pmm, index: usize) -> Result<Commit, VmError> {
        self.check_index(index)?;
        let mut inner = self.inner.lock();
        if let Some(page) = &inner.slots[index] {
            return Ok(Commit::Present(SlotMapping {
                paddr: page.paddr(),
                cow: inner.cow.get(index),
            }));
        }
        if inner.purged.get(index) && !inner.is_volatile(index) {
            return Err(VmError::StaleVolatileAccess);
        }
        let page = inner.allocate_private(pmm)?;
        let paddr = page.paddr();
        inner.slots[index] = Some(page);
        inner.purged.clear(index);
        ktrace!("AnonymousVmObject: zero-filled page {} at {}", index, paddr);
        Ok(Commit::Allocated(paddr))
    }

    /// Resolves a write to a copy-on-write page.
    ///
    /// If the page is no longer shared it is simply made private. Otherwise
    /// its contents are copied into a fresh frame, which replaces the slot
    /// and drops one reference to the shared frame.
    ///
    /// # Errors
    ///
    /// [`VmError::ProtectionViolation`] if the slot is not COW (or not
    /// backed), [`VmError::CapacityExhausted`] if no frame is available for
    /// the copy.
    pub fn handle_cow_fault(
        &self,
        pmm: &Pmm,
        index: usize,
        vaddr: VirtAddr,
    ) -> Result<CowResolution, VmError> {
        self.check_index(index)?;
        let mut inner = self.inner.lock();
        if !inner.cow.get(index) {
            return Err(VmError::ProtectionViolation);
        }
        let Some(shared) = inner.slots[index].clone() else {
            return Err(VmError::ProtectionViolation);
        };
        // Our clone above accounts for one reference.
        if shared.ref_count() == 2 {
            inner.cow.clear(index);
            ktrace!("COW: {} page {} no longer shared, reusing {}", vaddr, index, shared.paddr());
            return Ok(CowResolution::Reused(shared.paddr()));
        }

        let private = pmm.allocate_page(ShouldZeroFill::No)?;
        pmm.copy_page(&shared, &private);
        let paddr = private.paddr();
        inner.slots[index] = Some(private);
        inner.cow.clear(index);
        ktrace!("COW: {} page {} copied {} -> {}", vaddr, index, shared.paddr(), paddr);
        Ok(CowResolution::Copied(paddr))
    }

    /// Creates the child half of a fork.
    ///
    /// Backed slots are shared and marked COW in both objects. Unbacked and
    /// purged slots stay that way in the child. Reserved-but-unused frames
    /// are committed again for the child.
    ///
    /// # Errors
    ///
    /// [`VmError::CapacityExhausted`] if the child's commitment cannot be
    /// satisfied.
    pub fn try_clone(&self, pmm: &Arc<Pmm>) -> Result<Self, VmError> {
        let mut inner = self.inner.lock();
        self.share_locked(&mut inner, pmm)
    }

    /// Creates the child half of a fork of address space `space`.
    ///
    /// Behaves like [`try_clone`](Self::try_clone) while every region
    /// mapping the object belongs to `space`. If another space maps it too,
    /// that space may still hold writable translations of the frames, so
    /// the child gets private copies instead and no page turns COW.
    ///
    /// # Errors
    ///
    /// [`VmError::CapacityExhausted`] if the commitment or the copies
    /// cannot be satisfied.
    pub fn try_clone_for_fork(&self, pmm: &Arc<Pmm>, space: AddressSpaceId) -> Result<Self, VmError> {
        let mut inner = self.inner.lock();
        if inner.regions.iter().all(|region| region.space == space) {
            self.share_locked(&mut inner, pmm)
        } else {
            self.copy_locked(&inner, pmm)
        }
    }

    fn recommit(inner: &AnonymousInner, pmm: &Arc<Pmm>) -> Result<Option<CommittedPages>, VmError> {
        Ok(match &inner.committed {
            Some(c) if c.remaining() > 0 => Some(pmm.commit(c.remaining())?),
            _ => None,
        })
    }

    fn share_locked(&self, inner: &mut AnonymousInner, pmm: &Arc<Pmm>) -> Result<Self, VmError> {
        let committed = Self::recommit(inner, pmm)?;
        let slots = inner.slots.clone();
        for (index, slot) in slots.iter().enumerate() {
            if slot.is_some() {
                inner.cow.set(index);
            }
        }
        let child = Self::from_parts(self.page_count, self.purgeable, slots, committed);
        {
            let mut child_inner = child.inner.lock();
            child_inner.cow = inner.cow.clone();
            child_inner.purged = inner.purged.clone();
        }
        kdebug!(
            "AnonymousVmObject: cloned {} pages, {} now COW",
            self.page_count,
            inner.cow.count_ones()
        );
        Ok(child)
    }

    fn copy_locked(&self, inner: &AnonymousInner, pmm: &Arc<Pmm>) -> Result<Self, VmError> {
        let committed = Self::recommit(inner, pmm)?;
        let slots = inner
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|page| {
                        let copy = pmm.allocate_page(ShouldZeroFill::No)?;
                        pmm.copy_page(page, &copy);
                        Ok::<_, VmError>(copy)
                    })
                    .transpose()
            })
            .collect::<Result<Vec<_>, VmError>>()?;
        let copied = slots.iter().flatten().count();
        let child = Self::from_parts(self.page_count, self.purgeable, slots, committed);
        child.inner.lock().purged = inner.purged.clone();
        kdebug!(
            "AnonymousVmObject: mapped elsewhere, copied {} of {} pages",
            copied,
            self.page_count
        );
        Ok(child)
    }

    // -----------------------------------------------------------------------
    // Purgeable ranges
    // -----------------------------------------------------------------------

    /// Attaches a region's volatile range set.
    ///
    /// # Errors
    ///
    /// [`VmError::NotPurgeable`] if the object was not created purgeable.
    pub fn register_purgeable_page_ranges(
        &self,
        owner: RegionRef,
        initial: VolatilePageRanges,
    ) -> Result<(), VmError> {
        if !self.purgeable {
            return Err(VmError::NotPurgeable);
        }
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.purgeable.iter().all(|r| r.owner != owner),
            "purgeable ranges registered twice"
        );
        inner.purgeable.push(Registration {
            owner,
            volatile: initial,
        });
        Ok(())
    }

    /// Detaches a region's volatile range set.
    pub fn unregister_purgeable_page_ranges(&self, owner: RegionRef) {
        self.inner.lock().purgeable.retain(|r| r.owner != owner);
    }

    /// Copy of a region's volatile ranges.
    pub fn volatile_ranges(&self, owner: RegionRef) -> Option<VolatilePageRanges> {
        let inner = self.inner.lock();
        inner
            .purgeable
            .iter()
            .find(|r| r.owner == owner)
            .map(|r| r.volatile.clone())
    }

    /// Marks object pages `[first, first + count)` volatile for `owner`.
    ///
    /// # Errors
    ///
    /// [`VmError::NotPurgeable`] if `owner` never registered,
    /// [`VmError::OutOfBoundsAccess`] if the range leaves the object.
    pub fn set_volatile(&self, owner: RegionRef, first: usize, count: usize) -> Result<(), VmError> {
        self.check_span(first, count)?;
        self.inner
            .lock()
            .registration_mut(owner)?
            .volatile
            .add(first, count);
        Ok(())
    }

    /// Marks object pages `[first, first + count)` non-volatile for `owner`.
    ///
    /// Returns `true` if any of them was purged while volatile; those pages
    /// stay unusable until [`repopulate`](Self::repopulate).
    pub fn set_nonvolatile(
        &self,
        owner: RegionRef,
        first: usize,
        count: usize,
    ) -> Result<bool, VmError> {
        self.check_span(first, count)?;
        let (_, was_purged) = self
            .inner
            .lock()
            .registration_mut(owner)?
            .volatile
            .remove(first, count);
        Ok(was_purged)
    }

    /// Clears the purged marks of `[first, first + count)` so that the next
    /// touch zero-fills instead of reporting a stale access.
    ///
    /// Returns the number of pages that were marked purged.
    pub fn repopulate(&self, first: usize, count: usize) -> Result<usize, VmError> {
        self.check_span(first, count)?;
        let mut inner = self.inner.lock();
        let mut cleared = 0;
        for index in first..first + count {
            if inner.purged.get(index) {
                inner.purged.clear(index);
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Whether slot `index` was purged and not yet refilled.
    pub fn is_purged(&self, index: usize) -> Result<bool, VmError> {
        self.check_index(index)?;
        Ok(self.inner.lock().purged.get(index))
    }

    /// Whether any registration currently holds a volatile range.
    pub fn is_any_volatile(&self) -> bool {
        self.inner
            .lock()
            .purgeable
            .iter()
            .any(|r| !r.volatile.is_empty())
    }

    /// Takes every backed page that all registrations mark volatile out of
    /// the object.
    ///
    /// Each purged slot gets its purged bit set and the owning volatile
    /// ranges are flagged `was_purged`. See [`PurgedPages`] for the release
    /// protocol.
    pub fn purge(&self) -> PurgedPages {
        let mut inner = self.inner.lock();
        let Some(first) = inner.purgeable.first() else {
            return PurgedPages::default();
        };
        let candidates: Vec<usize> = first.volatile.indices().collect();

        let mut pages = Vec::new();
        for index in candidates {
            if !inner.is_volatile(index) {
                continue;
            }
            let Some(page) = inner.slots[index].take() else {
                continue;
            };
            inner.cow.clear(index);
            inner.purged.set(index);
            for registration in &mut inner.purgeable {
                registration.volatile.mark_purged(index);
            }
            pages.push((index, page));
        }
        if !pages.is_empty() {
            kdebug!("AnonymousVmObject: purged {} pages", pages.len());
        }
        PurgedPages {
            pages,
            regions: inner.regions.clone(),
        }
    }

    fn check_window(&self, first: usize, count: usize) -> Result<(), VmError> {
        match first.checked_add(count) {
            Some(end) if end <= self.page_count => Ok(()),
            _ => Err(VmError::OutOfBoundsAccess),
        }
    }

    fn check_span(&self, first: usize, count: usize) -> Result<(), VmError> {
        match first.checked_add(count) {
            Some(end) if count > 0 && end <= self.page_count => Ok(()),
            _ => Err(VmError::OutOfBoundsAccess),
        }
    }
}

impl core::fmt::Debug for AnonymousVmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnonymousVmObject")
            .field("page_count", &self.page_count)
            .field("purgeable", &self.purgeable)
            .finish_non_exhaustive()
    }
}
