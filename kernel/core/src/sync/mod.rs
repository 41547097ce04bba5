//! Synchronization primitives.
//!
//! The memory manager only needs [`SpinLock`]: every lock it takes is short,
//! held with interrupts already masked by the caller, and must be usable
//! from the page-fault path where sleeping is not an option.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
