//! Higher Half Direct Map (HHDM) translation.
//!
//! Every physical frame is reachable at `phys + offset`. The offset is handed
//! to the memory manager at construction instead of being read from a
//! global, so the host test suite can point it at an ordinary heap buffer.

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::PAGE_SIZE;

/// Poison pattern written to freed frames: `0xDEAD_DEAD` repeated.
const PAGE_POISON_PATTERN: u32 = 0xDEAD_DEAD;

/// Physical-to-virtual translation through the direct map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hhdm {
    offset: u64,
}

impl Hhdm {
    /// Creates a translation with the bootloader-provided offset.
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the raw offset.
    pub const fn offset(self) -> u64 {
        self.offset
    }

    /// Converts a physical address to its direct-map virtual address.
    #[inline]
    pub fn phys_to_virt(self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new_truncate(self.offset.wrapping_add(phys.as_u64()))
    }

    #[inline]
    fn frame_ptr(self, phys: PhysAddr) -> *mut u8 {
        self.offset.wrapping_add(phys.as_u64()) as *mut u8
    }

    /// Zeroes one frame.
    ///
    /// # Safety
    ///
    /// `frame` must be a frame the caller owns exclusively, reachable through
    /// this direct map.
    pub unsafe fn zero_frame(self, frame: PhysAddr) {
        // SAFETY: The caller guarantees exclusive ownership of a mapped frame.
        unsafe { core::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE) };
    }

    /// Copies the contents of `src` into `dst`.
    ///
    /// # Safety
    ///
    /// Both frames must be mapped through this direct map, `dst` must be
    /// owned exclusively by the caller and `src` must not be written to
    /// concurrently.
    pub unsafe fn copy_frame(self, src: PhysAddr, dst: PhysAddr) {
        debug_assert_ne!(src, dst, "copy_frame: source and destination alias");
        // SAFETY: Distinct frames never overlap; validity is on the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(self.frame_ptr(src), self.frame_ptr(dst), PAGE_SIZE);
        }
    }

    /// Reads bytes from a frame at `offset`.
    ///
    /// # Safety
    ///
    /// The frame must be mapped through this direct map and not written to
    /// concurrently.
    pub unsafe fn read(self, frame: PhysAddr, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "read crosses frame boundary");
        // SAFETY: Bounds checked above; validity is on the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(frame).add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    /// Writes bytes into a frame at `offset`.
    ///
    /// # Safety
    ///
    /// The frame must be mapped through this direct map and owned by the
    /// caller for the duration of the write.
    pub unsafe fn write(self, frame: PhysAddr, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "write crosses frame boundary");
        // SAFETY: Bounds checked above; validity is on the caller.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.frame_ptr(frame).add(offset),
                data.len(),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Page poisoning (always compiled so `cfg!()` call sites type-check)
    // -----------------------------------------------------------------------

    /// Fills a freed frame with the poison pattern.
    pub(crate) fn poison_frame(self, frame: PhysAddr) {
        let words = self.frame_ptr(frame).cast::<u32>();
        for i in 0..PAGE_SIZE / 4 {
            // SAFETY: The frame was just freed and is reachable through the
            // direct map; nobody else may touch it.
            unsafe { words.add(i).write_volatile(PAGE_POISON_PATTERN) };
        }
    }

    /// Checks that a previously poisoned frame is still intact.
    ///
    /// Frames that were never poisoned (first word differs) pass. Returns
    /// `false` only on partial corruption, which indicates a write after free.
    pub(crate) fn check_poison(self, frame: PhysAddr) -> bool {
        let words = self.frame_ptr(frame).cast::<u32>();
        // SAFETY: The frame is free and reachable through the direct map.
        if unsafe { words.read_volatile() } != PAGE_POISON_PATTERN {
            return true;
        }
        // SAFETY: As above.
        (1..PAGE_SIZE / 4).all(|i| unsafe { words.add(i).read_volatile() } == PAGE_POISON_PATTERN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FrameBuffer;

    #[test]
    fn zero_copy_and_read_back() {
        let mem = FrameBuffer::new(2);
        let hhdm = mem.hhdm();
        let a = mem.frame(0);
        let b = mem.frame(1);
        // SAFETY: Both frames belong to the test buffer.
        unsafe {
            hhdm.write(a, 100, b"kestrel");
            hhdm.copy_frame(a, b);
            let mut out = [0u8; 7];
            hhdm.read(b, 100, &mut out);
            assert_eq!(&out, b"kestrel");
            hhdm.zero_frame(b);
            hhdm.read(b, 100, &mut out);
            assert_eq!(out, [0; 7]);
        }
    }

    #[test]
    fn poison_detects_partial_corruption() {
        let mem = FrameBuffer::new(1);
        let hhdm = mem.hhdm();
        let frame = mem.frame(0);
        assert!(hhdm.check_poison(frame), "never-poisoned frame passes");
        hhdm.poison_frame(frame);
        assert!(hhdm.check_poison(frame));
        // SAFETY: The frame belongs to the test buffer.
        unsafe { hhdm.write(frame, 2048, &[0, 0, 0, 0]) };
        assert!(!hhdm.check_poison(frame));
    }

    #[test]
    fn phys_to_virt_applies_offset() {
        let hhdm = Hhdm::new(0xFFFF_8000_0000_0000);
        assert_eq!(
            hhdm.phys_to_virt(PhysAddr::new(0x1000)).as_u64(),
            0xFFFF_8000_0000_1000
        );
    }
}
