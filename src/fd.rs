//! Process-wide per-descriptor metadata.
//!
//! The [`FdManager`] singleton keeps one [`FdCtx`] per raw fd, created
//! lazily on first `get(fd, auto_create = true)` from a cooperative I/O
//! wrapper and removed on close. A context records whether the descriptor
//! is a socket, its read/write timeouts, and the two non-blocking flags:
//!
//! - the *system* flag tracks the `O_NONBLOCK` the runtime itself forces so
//!   a fiber never blocks its thread;
//! - the *user* flag tracks what the caller asked for. With it set, the
//!   cooperative wrappers surface `WouldBlock` instead of parking, exactly
//!   like a hand-managed non-blocking descriptor.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::io::Direction;

/// Sentinel for "no timeout configured".
const NO_TIMEOUT: u64 = u64::MAX;

////////////////////////////////////////////////////////////////////////////////
// FdCtx
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let ctx = Self {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            write_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        if is_socket {
            ctx.force_sys_nonblock();
        }
        ctx
    }

    /// Put the descriptor into `O_NONBLOCK` at the OS level regardless of
    /// what the user requested. The user-visible blocking semantics are
    /// reconstructed by the cooperative wrappers.
    pub fn force_sys_nonblock(&self) {
        if self.sys_nonblock.swap(true, Ordering::AcqRel) {
            return;
        }
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// What the user requested through the non-blocking toggle. This does
    /// not change the OS flag, which the runtime controls.
    #[inline]
    pub fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::Release);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_timeout(&self, direction: Direction, timeout: Option<Duration>) {
        let ms = match timeout {
            Some(t) => (t.as_millis() as u64).min(NO_TIMEOUT - 1),
            None => NO_TIMEOUT,
        };
        self.timeout_cell(direction).store(ms, Ordering::Release);
    }

    pub fn timeout(&self, direction: Direction) -> Option<Duration> {
        match self.timeout_cell(direction).load(Ordering::Acquire) {
            NO_TIMEOUT => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn timeout_cell(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Read => &self.read_timeout_ms,
            Direction::Write => &self.write_timeout_ms,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// FdManager
////////////////////////////////////////////////////////////////////////////////

/// Dense table keyed by raw fd number; the index equal to the fd keeps
/// lookup O(1). Entries are created lazily and torn down on close; the
/// table itself lives until process exit.
#[derive(Debug, Default)]
pub struct FdManager {
    entries: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let entries = self.entries.read().expect("fd manager lock poisoned");
            if let Some(Some(ctx)) = entries.get(index) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let mut entries = self.entries.write().expect("fd manager lock poisoned");
        if index >= entries.len() {
            entries.resize(index + 1, None);
        }
        if entries[index].is_none() {
            entries[index] = Some(Arc::new(FdCtx::new(fd)));
        }
        entries[index].clone()
    }

    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.write().expect("fd manager lock poisoned");
        if let Some(entry) = entries.get_mut(fd as usize) {
            *entry = None;
        }
    }
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::default);

/// The process-wide descriptor table.
#[inline]
pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fds() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn get_without_auto_create_misses() {
        let (r, w) = pipe_fds();
        let manager = FdManager::default();
        assert!(manager.get(r, false).is_none());
        assert!(manager.get(r, true).is_some());
        assert!(manager.get(r, false).is_some());
        manager.del(r);
        assert!(manager.get(r, false).is_none());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn pipe_is_not_a_socket() {
        let (r, w) = pipe_fds();
        let manager = FdManager::default();
        let ctx = manager.get(r, true).unwrap();
        assert!(!ctx.is_socket());
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn socket_is_forced_nonblocking() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);

        let manager = FdManager::default();
        let ctx = manager.get(fds[0], true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());

        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        // The user-visible flag stays independent.
        assert!(!ctx.user_nonblock());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn timeouts_are_per_direction() {
        let (r, w) = pipe_fds();
        let manager = FdManager::default();
        let ctx = manager.get(r, true).unwrap();

        assert_eq!(ctx.timeout(Direction::Read), None);
        ctx.set_timeout(Direction::Read, Some(Duration::from_millis(50)));
        assert_eq!(ctx.timeout(Direction::Read), Some(Duration::from_millis(50)));
        assert_eq!(ctx.timeout(Direction::Write), None);

        ctx.set_timeout(Direction::Read, None);
        assert_eq!(ctx.timeout(Direction::Read), None);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
