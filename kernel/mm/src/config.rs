//! Memory manager tunables.
//!
//! Runtime knobs are grouped in [`MmConfig`]; the defaults match a 4-level
//! x86_64 user half. Frame poisoning is a compile-time switch:
//! build with `--cfg kestrel_debug_pmm_poison` to fill freed frames with
//! `0xDEAD_DEAD` and check the pattern on reallocation.

use kestrel_core::addr::VirtAddr;

use crate::physical::{DEFAULT_ZONE_SIZES, MIN_ZONE_FRAMES};

/// Lowest user virtual address handed out (keeps the null page region
/// unmapped).
pub const DEFAULT_USER_BASE: u64 = 0x0000_0000_0040_0000;

/// One past the highest user virtual address.
pub const DEFAULT_USER_END: u64 = 0x0000_7FFF_FFFF_0000;

/// Memory manager configuration.
#[derive(Debug, Clone, Copy)]
pub struct MmConfig {
    /// Zone sizes in frames, largest first.
    pub zone_sizes: &'static [usize],
    /// Usable runs shorter than this are ignored at boot.
    pub min_region_frames: usize,
    /// Frames split off for early-boot allocators (0 = none).
    pub bootstrap_frames: usize,
    /// Start of the user virtual range.
    pub user_base: VirtAddr,
    /// End of the user virtual range (exclusive).
    pub user_end: VirtAddr,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            zone_sizes: &DEFAULT_ZONE_SIZES,
            min_region_frames: MIN_ZONE_FRAMES,
            bootstrap_frames: 0,
            user_base: VirtAddr::new(DEFAULT_USER_BASE),
            user_end: VirtAddr::new(DEFAULT_USER_END),
        }
    }
}
