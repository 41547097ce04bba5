//! Reference-counted physical frame handles.

use alloc::sync::Arc;

use kestrel_core::addr::PhysAddr;
use kestrel_core::kerr;

use super::region::PhysicalRegion;

struct Frame {
    addr: PhysAddr,
    /// `None` for memory the allocator does not manage.
    region: Option<Arc<PhysicalRegion>>,
}

impl Drop for Frame {
    fn drop(&mut self) {
        let Some(region) = &self.region else {
            return;
        };
        if let Err(err) = region.return_page(self.addr) {
            kerr!("PhysicalPage: failed to return frame {}: {}", self.addr, err);
        }
    }
}

/// An owned reference to one physical frame.
///
/// Cloning adds a reference; dropping the last reference returns the frame
/// to the zone it came from. The reference count is the number of live
/// `PhysicalPage` values for the frame (VM object slots plus any transient
/// handles).
#[derive(Clone)]
pub struct PhysicalPage(Arc<Frame>);

impl PhysicalPage {
    pub(super) fn new(addr: PhysAddr, region: Arc<PhysicalRegion>) -> Self {
        Self(Arc::new(Frame {
            addr,
            region: Some(region),
        }))
    }

    /// A handle to a frame outside every allocator region. Dropping the
    /// last reference does nothing.
    pub(crate) fn unmanaged(addr: PhysAddr) -> Self {
        Self(Arc::new(Frame { addr, region: None }))
    }

    /// Whether the frame goes back to an allocator when released.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.0.region.is_some()
    }

    /// Physical address of the frame.
    #[inline]
    pub fn paddr(&self) -> PhysAddr {
        self.0.addr
    }

    /// Current number of references to the frame.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Returns `true` if both handles refer to the same frame.
    #[inline]
    pub fn same_frame(&self, other: &PhysicalPage) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("paddr", &self.paddr())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
