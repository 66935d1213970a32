//! Raw test-and-set spinlock.
//!
//! Critical sections in this crate are a handful of loads and stores, so a
//! full parking mutex is the wrong tool: the uncontended path must stay a
//! single compare-exchange, and the contended path is short enough that
//! spinning (with [`Backoff`] snoozes) beats a syscall.
//!
//! The acquire on lock and release on unlock are the only memory fences the
//! channel protocol relies on; everything published under a lock is visible
//! to the next holder of that lock.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

pub(crate) struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub(crate) fn lock(&self) {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    /// Acquires the lock if it is free, without spinning.
    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Callers must hold the lock; this is not checked.
    #[inline]
    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}
