//! Time values derived from the POSIX `clock_gettime` family.
//!
//! Functions with names followed by "64" return a 64-bit number of
//! nanoseconds; the `_ms` variants return milliseconds.
//!
//! - [`monotonic_ms()`] - monotonic time in milliseconds (timer deadlines)
//! - [`monotonic64()`] - monotonic time in nanoseconds
//! - [`time64()`] - wall clock time in nanoseconds since epoch
//!
//! All expiries in the runtime are computed from the monotonic source, never
//! the wall clock. [`Clock`] abstracts the source so tests can drive it.

use std::sync::Arc;

#[inline]
fn clock_gettime(clock_id: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    // CLOCK_MONOTONIC/CLOCK_REALTIME are valid on every supported target.
    debug_assert_eq!(rc, 0);
    ts
}

/// The monotonic time in nanoseconds since an unspecified starting point.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`. Monotonic time is not
/// affected by discontinuous jumps in the system time and is the source for
/// all timer arithmetic in this crate.
#[inline(always)]
pub fn monotonic64() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The monotonic time in milliseconds.
///
/// See: [`monotonic64()`]
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// The wall clock time in nanoseconds since epoch (1970-01-01 00:00:00).
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`. Useful for log stamps, not
/// for deadlines.
#[inline(always)]
pub fn time64() -> u64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// A source of monotonic milliseconds.
///
/// The default reads [`monotonic_ms`]. A custom source can be injected into
/// a [`TimerManager`](crate::timer::TimerManager) to make expiry and clock
/// rollback behavior testable without sleeping.
#[derive(Clone)]
pub struct Clock {
    now_ms: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl Clock {
    /// A clock backed by `CLOCK_MONOTONIC`.
    #[inline]
    pub fn monotonic() -> Self {
        Self {
            now_ms: Arc::new(monotonic_ms),
        }
    }

    /// A clock backed by an arbitrary function returning milliseconds.
    #[inline]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self { now_ms: Arc::new(f) }
    }

    /// Current reading of the source, in milliseconds.
    #[inline(always)]
    pub fn now_ms(&self) -> u64 {
        (self.now_ms)()
    }
}

impl Default for Clock {
    #[inline]
    fn default() -> Self {
        Self::monotonic()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}
