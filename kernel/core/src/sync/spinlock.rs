//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spin-based mutual exclusion lock.
///
/// Const-constructable so it can live in `static` items. Each lock carries a
/// static name that shows up in its `Debug` output, which makes lock-order
/// reports readable.
pub struct SpinLock<T> {
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different CPUs.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked, anonymous `SpinLock`.
    pub const fn new(value: T) -> Self {
        Self::named("<anon>", value)
    }

    /// Creates a new unlocked `SpinLock` with a diagnostic name.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Returns the diagnostic name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }

            // TTAS: spin on a shared read until the lock looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| SpinLockGuard { lock: self })
    }

    /// Returns `true` if the lock is currently held by someone.
    ///
    /// Only meaningful for assertions; the answer may be stale immediately.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns a mutable reference to the data. No locking is needed since
    /// `&mut self` proves exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(10);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 10);
    }

    #[test]
    fn get_mut_and_into_inner() {
        let mut lock = SpinLock::named("test", vec![1, 2]);
        lock.get_mut().push(3);
        assert_eq!(lock.name(), "test");
        assert_eq!(lock.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        const THREADS: usize = 4;
        const ITERS: usize = 10_000;

        let lock = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), THREADS * ITERS);
    }
}
