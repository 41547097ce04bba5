//! Core library for the Kestrel kernel: typed addresses, spin locks and the
//! leveled logging interface used by every other kernel crate.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod log;
pub mod sync;

/// Size of a base page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
