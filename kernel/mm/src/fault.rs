//! Page-fault resolution protocol.
//!
//! The platform trap handler turns a hardware fault into a [`PageFault`]
//! and hands it to
//! [`MemoryManager::handle_page_fault`](crate::manager::MemoryManager::handle_page_fault),
//! which drives a [`FaultResolver`] through these states:
//!
//! ```text
//! Trapped -> RegionLookup -> Delegated -> Resolved
//!                 |              |-----> Fatal(err)
//!                 v              '-----> OutOfMemory (after one purge + retry)
//!             Unmapped
//! ```
//!
//! Running out of frames during delegation triggers one global purge of
//! volatile memory, then the lookup is retried. Nothing else is retried.

use alloc::sync::Arc;

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::{kerr, ktrace, kwarn};

use crate::VmError;
use crate::address_space::{AddressSpace, RegionRef};
use crate::manager::MemoryManager;
use crate::vm::CowResolution;

/// Kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    /// Data load.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Execute,
}

/// A page fault as delivered by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting virtual address.
    pub address: VirtAddr,
    /// What the access was.
    pub access: FaultAccess,
    /// Whether a translation existed (protection fault) or not.
    pub present: bool,
}

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// The slot was already backed; only the translation was installed.
    Remapped,
    /// A zero-filled frame was committed into the slot.
    ZeroFilled,
    /// A COW page was copied into a private frame.
    CowCopied,
    /// A COW page had no other sharer and was made private in place.
    CowReused,
}

impl ResolutionKind {
    /// Whether the object slot changed, so other regions mapping the same
    /// page must be refreshed.
    pub fn changed_slot(self) -> bool {
        !matches!(self, Self::Remapped)
    }
}

impl From<CowResolution> for ResolutionKind {
    fn from(cow: CowResolution) -> Self {
        match cow {
            CowResolution::Reused(_) => Self::CowReused,
            CowResolution::Copied(_) => Self::CowCopied,
        }
    }
}

/// A resolved fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Region that took the fault.
    pub region: RegionRef,
    /// Object page that was mapped.
    pub object_index: usize,
    /// Frame now mapped at the faulting page.
    pub paddr: PhysAddr,
    /// What had to be done.
    pub kind: ResolutionKind,
}

/// State of a [`FaultResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// Fault delivered, nothing looked at yet.
    Trapped,
    /// Searching the address space for the owning region.
    RegionLookup,
    /// The region is handling the fault.
    Delegated,
    /// A translation is installed; execution may resume.
    Resolved(Resolution),
    /// No region covers the address.
    Unmapped,
    /// The access is illegal.
    Fatal(VmError),
    /// No frame could be found even after purging.
    OutOfMemory,
}

impl FaultState {
    /// Whether the resolver stops here.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Resolved(_) | Self::Unmapped | Self::Fatal(_) | Self::OutOfMemory
        )
    }
}

/// Final result of fault handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Resume the faulting context.
    Resolved(Resolution),
    /// Access outside any region.
    Unmapped,
    /// Illegal access; deliver to the owning context.
    Fatal(VmError),
    /// Out of memory; escalate to the reclamation policy.
    OutOfMemory,
}

/// Steps one fault through the protocol.
pub struct FaultResolver<'a> {
    manager: &'a MemoryManager,
    space: Arc<AddressSpace>,
    fault: PageFault,
    state: FaultState,
    purged: bool,
}

impl<'a> FaultResolver<'a> {
    /// A resolver in [`FaultState::Trapped`].
    pub fn new(manager: &'a MemoryManager, space: Arc<AddressSpace>, fault: PageFault) -> Self {
        Self {
            manager,
            space,
            fault,
            state: FaultState::Trapped,
            purged: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> FaultState {
        self.state
    }

    /// Advances by one transition and returns the new state.
    pub fn step(&mut self) -> FaultState {
        let next = match self.state {
            FaultState::Trapped => FaultState::RegionLookup,
            FaultState::RegionLookup => {
                if self.space.find_region(self.fault.address).is_some() {
                    FaultState::Delegated
                } else {
                    FaultState::Unmapped
                }
            }
            FaultState::Delegated => self.delegate(),
            terminal => terminal,
        };
        ktrace!(
            "fault {} {:?} in {:?}: {:?} -> {:?}",
            self.fault.address,
            self.fault.access,
            self.space.id(),
            self.state,
            next
        );
        self.state = next;
        next
    }

    fn delegate(&mut self) -> FaultState {
        let pmm = self.manager.pmm();
        match self.space.handle_fault(pmm, &self.fault) {
            Ok((resolution, object)) => {
                if resolution.kind.changed_slot() {
                    self.manager
                        .remap_object_page(&object, resolution.object_index, resolution.region);
                }
                FaultState::Resolved(resolution)
            }
            Err(VmError::NoSuchRegion) => FaultState::Unmapped,
            Err(VmError::CapacityExhausted) if !self.purged => {
                self.purged = true;
                let reclaimed = self.manager.purge_all_volatile();
                kwarn!(
                    "fault {}: out of memory, purged {} volatile pages, retrying",
                    self.fault.address,
                    reclaimed
                );
                FaultState::RegionLookup
            }
            Err(VmError::CapacityExhausted) => FaultState::OutOfMemory,
            Err(err) => FaultState::Fatal(err),
        }
    }

    /// Steps until a terminal state.
    pub fn run(mut self) -> FaultOutcome {
        while !self.state.is_terminal() {
            self.step();
        }
        match self.state {
            FaultState::Resolved(resolution) => FaultOutcome::Resolved(resolution),
            FaultState::Unmapped => {
                kerr!("fault {} {:?}: no region", self.fault.address, self.fault.access);
                FaultOutcome::Unmapped
            }
            FaultState::Fatal(err) => {
                kerr!("fault {} {:?}: {}", self.fault.address, self.fault.access, err);
                FaultOutcome::Fatal(err)
            }
            _ => {
                kerr!("fault {}: out of memory", self.fault.address);
                FaultOutcome::OutOfMemory
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{Placement, RegionSpec};
    use crate::region::Access;
    use crate::test_support::{SoftPageTable, TestMemory};
    use crate::vm::{AllocationStrategy, AnonymousVmObject, VmObject};
    use alloc::boxed::Box;

    fn write(address: VirtAddr) -> PageFault {
        PageFault {
            address,
            access: FaultAccess::Write,
            present: false,
        }
    }

    #[test]
    fn walks_the_state_machine() {
        let mem = TestMemory::new(128);
        let manager = mem.manager();
        let space = manager.create_address_space(Box::new(SoftPageTable::new()));
        let region = manager
            .map_anonymous(space.id(), 4, AllocationStrategy::None, Access::RW)
            .unwrap();

        let mut resolver = FaultResolver::new(&manager, Arc::clone(&space), write(region.base));
        assert_eq!(resolver.step(), FaultState::RegionLookup);
        assert_eq!(resolver.step(), FaultState::Delegated);
        let FaultState::Resolved(resolution) = resolver.step() else {
            panic!("fault not resolved");
        };
        assert_eq!(resolution.kind, ResolutionKind::ZeroFilled);
        assert_eq!(resolution.region, region);
        assert!(resolver.state().is_terminal());
        assert_eq!(space.translate(region.base), Some(resolution.paddr));
    }

    #[test]
    fn unmapped_address() {
        let mem = TestMemory::new(128);
        let manager = mem.manager();
        let space = manager.create_address_space(Box::new(SoftPageTable::new()));
        let outcome = FaultResolver::new(&manager, space, write(VirtAddr::new(0x1000))).run();
        assert_eq!(outcome, FaultOutcome::Unmapped);
    }

    #[test]
    fn exhaustion_purges_once_then_retries() {
        let mem = TestMemory::new(128);
        let manager = mem.manager();
        let space = manager.create_address_space(Box::new(SoftPageTable::new()));

        // A volatile cache holding every free frame.
        let cache = manager
            .create_anonymous(120, AllocationStrategy::AllocateNow, true)
            .unwrap();
        let cache_region = manager
            .map(space.id(), RegionSpec {
                object: Arc::clone(&cache),
                offset_in_object: 0,
                page_count: 120,
                placement: Placement::Anywhere,
                access: Access::RW,
                shared: false,
                purgeable: true,
                cacheable: true,
                kernel_only: false,
                name: "cache",
            })
            .unwrap();
        let _hog: Vec<_> = core::iter::from_fn(|| {
            mem.pmm().allocate_page(crate::pmm::ShouldZeroFill::No).ok()
        })
        .collect();
        manager.set_volatile(cache_region, 0, 120).unwrap();

        let heap = manager
            .map_anonymous(space.id(), 1, AllocationStrategy::None, Access::RW)
            .unwrap();
        let outcome = FaultResolver::new(&manager, Arc::clone(&space), write(heap.base)).run();
        assert!(matches!(outcome, FaultOutcome::Resolved(_)));
        assert_eq!(cache.resident_pages(0, 120), Ok(0));
        // The cache translations went with the frames.
        assert_eq!(space.translate(cache_region.base), None);
    }

    #[test]
    fn exhaustion_without_volatile_memory_is_oom() {
        let mem = TestMemory::new(128);
        let manager = mem.manager();
        let space = manager.create_address_space(Box::new(SoftPageTable::new()));
        let heap = manager
            .map_anonymous(space.id(), 1, AllocationStrategy::None, Access::RW)
            .unwrap();
        let _hog: Vec<_> = core::iter::from_fn(|| {
            mem.pmm().allocate_page(crate::pmm::ShouldZeroFill::No).ok()
        })
        .collect();
        let outcome = FaultResolver::new(&manager, space, write(heap.base)).run();
        assert_eq!(outcome, FaultOutcome::OutOfMemory);
    }

    #[test]
    fn write_to_read_only_region_is_fatal() {
        let mem = TestMemory::new(128);
        let manager = mem.manager();
        let space = manager.create_address_space(Box::new(SoftPageTable::new()));
        let object = Arc::new(VmObject::Anonymous(
            AnonymousVmObject::try_create(&mem.pmm(), 2, AllocationStrategy::None, false).unwrap(),
        ));
        let region = manager
            .map(space.id(), RegionSpec {
                object,
                offset_in_object: 0,
                page_count: 2,
                placement: Placement::Anywhere,
                access: Access::READ,
                shared: false,
                purgeable: false,
                cacheable: true,
                kernel_only: false,
                name: "rodata",
            })
            .unwrap();
        let outcome = manager.handle_page_fault(space.id(), write(region.base + 0x1000));
        assert_eq!(outcome, FaultOutcome::Fatal(VmError::ProtectionViolation));
    }
}
