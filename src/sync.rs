//! Synchronization building blocks the runtime uses internally.
//!
//! Only the primitives the standard library lacks live here: a counting
//! [`Semaphore`] and a [`SpinLock`] with an RAII guard. Mutex, rwlock and
//! condvar needs are served by `std::sync` directly, which already exposes
//! scoped guards with release on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

/// A process-internal counting semaphore.
///
/// `wait` blocks the calling OS thread until a permit is available; `notify`
/// releases one permit. Used for startup handshakes, not on fiber hot paths
/// (a fiber must never block its thread through this type while parked work
/// could run).
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    #[inline]
    pub fn new(permits: u32) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        while *permits == 0 {
            permits = self.cond.wait(permits).expect("semaphore lock poisoned");
        }
        *permits -= 1;
    }

    /// Release one permit, waking a waiter if any.
    pub fn notify(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        *permits += 1;
        self.cond.notify_one();
    }
}

////////////////////////////////////////////////////////////////////////////////
// SpinLock
////////////////////////////////////////////////////////////////////////////////

/// An atomic-flag spinlock.
///
/// Appropriate only for sections of a few instructions where the holder
/// cannot yield or block. The guard releases the lock on every exit path.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

/// An RAII implementation of a "scoped lock" of a [`SpinLock`]. When this
/// structure is dropped (falls out of scope), the lock will be unlocked.
#[derive(Debug)]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
