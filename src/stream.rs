//! Cooperative input/output.
//!
//! Explicit async primitives with the blocking signatures of their libc
//! counterparts: each one tries the syscall once, and on `EAGAIN` parks the
//! calling fiber on the descriptor's readiness instead of blocking the
//! thread (try, park, wait, retry). Registrations are edge-triggered, so a
//! resumed operation always retries until it either completes or hits
//! `EAGAIN` again and re-parks.
//!
//! Timeouts come from the argument or, when absent, from the descriptor's
//! entry in the [fd table](crate::fd); an expired wait surfaces as
//! `ErrorKind::TimedOut`. A descriptor whose user asked for non-blocking
//! semantics (see [`FdCtx::set_user_nonblock`](crate::fd::FdCtx)) never
//! parks: the caller gets `WouldBlock`, like a hand-managed socket.
//!
//! Called from outside a runtime, every primitive degrades to ordinary
//! blocking behavior over `poll(2)`.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::fd::fd_manager;
use crate::fiber;
use crate::io::{Direction, IoManager};

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Park until `direction` readiness on `fd`, or until the timeout expires.
/// Yields; returns `ErrorKind::TimedOut` on expiry.
///
/// Off-runtime this blocks the calling thread in `poll(2)` instead.
pub fn wait(fd: RawFd, direction: Direction, timeout: Option<Duration>) -> io::Result<()> {
    let io = match (IoManager::current(), fiber::current()) {
        (Some(io), Some(_)) => io,
        _ => return poll_wait(fd, direction, timeout),
    };

    io.add_event(fd, direction)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    // The timeout is a conditional timer: it cancels the registration and
    // flags the waiter. Both the callback and the timer condition reference
    // the flag weakly, so a stale expiry that fires after this call has
    // returned cannot cancel an unrelated later registration on the same
    // descriptor.
    let timed_out = Arc::new(AtomicBool::new(false));
    let timer = timeout.map(|t| {
        let flag = Arc::downgrade(&timed_out);
        let io = io.clone();
        io.clone().add_conditional_timer(
            t,
            move || {
                if let Some(flag) = flag.upgrade() {
                    flag.store(true, Ordering::Release);
                    io.cancel_event(fd, direction);
                }
            },
            &timed_out,
            false,
        )
    });

    fiber::yield_to_hold();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    if timed_out.load(Ordering::Acquire) {
        return Err(io::ErrorKind::TimedOut.into());
    }
    Ok(())
}

/// The try-park-wait-retry loop shared by every cooperative syscall.
fn cooperative<F>(
    fd: RawFd,
    direction: Direction,
    timeout: Option<Duration>,
    mut op: F,
) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    let ctx = match fd_manager().get(fd, true) {
        Some(ctx) => ctx,
        None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // The runtime always forces O_NONBLOCK at the OS level; user-visible
    // blocking semantics are reconstructed by parking the fiber.
    ctx.force_sys_nonblock();
    let timeout = timeout.or_else(|| ctx.timeout(direction));

    loop {
        let rc = op();
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {}
            _ => return Err(err),
        }
        if ctx.user_nonblock() {
            // The user runs this descriptor non-blocking by hand.
            return Err(err);
        }

        wait(fd, direction, timeout)?;

        if ctx.is_closed() {
            // Cancelled by a concurrent close; the raw fd may already be
            // reused, so never retry the syscall on it.
            return Err(io::Error::from_raw_os_error(libc::ECANCELED));
        }
    }
}

/// Cooperative `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    cooperative(fd, Direction::Read, timeout, || unsafe {
        libc::read(fd, ptr as *mut libc::c_void, len)
    })
}

/// Cooperative `write(2)`.
pub fn write(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    let ptr = buf.as_ptr();
    let len = buf.len();
    cooperative(fd, Direction::Write, timeout, || unsafe {
        libc::write(fd, ptr as *const libc::c_void, len)
    })
}

/// Cooperative `readv(2)`.
pub fn read_vectored(
    fd: RawFd,
    bufs: &mut [io::IoSliceMut<'_>],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    cooperative(fd, Direction::Read, timeout, || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int)
    })
}

/// Cooperative `writev(2)`.
pub fn write_vectored(
    fd: RawFd,
    bufs: &[io::IoSlice<'_>],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    cooperative(fd, Direction::Write, timeout, || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int)
    })
}

/// Cooperative `recv(2)`.
pub fn recv(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    cooperative(fd, Direction::Read, timeout, || unsafe {
        libc::recv(fd, ptr as *mut libc::c_void, len, flags)
    })
}

/// Cooperative `send(2)`.
pub fn send(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let ptr = buf.as_ptr();
    let len = buf.len();
    cooperative(fd, Direction::Write, timeout, || unsafe {
        libc::send(fd, ptr as *const libc::c_void, len, flags)
    })
}

/// Cooperative `accept(2)`; returns the raw connected descriptor.
pub fn accept(fd: RawFd, timeout: Option<Duration>) -> io::Result<RawFd> {
    let accepted = cooperative(fd, Direction::Read, timeout, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize
    })?;
    Ok(accepted as RawFd)
}

/// Close a descriptor known to the runtime: cancels both parked directions
/// (when called on a runtime thread), drops its fd-table entry and closes
/// the fd. Fibers woken by the cancellation observe `ECANCELED` instead of
/// touching the now-reusable descriptor number.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(ctx) = fd_manager().get(fd, false) {
        ctx.mark_closed();
    }
    if let Some(io) = IoManager::current() {
        io.cancel_all(fd);
    }
    fd_manager().del(fd);
    let rc = unsafe { libc::close(fd) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn poll_wait(fd: RawFd, direction: Direction, timeout: Option<Duration>) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: match direction {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        },
        revents: 0,
    };
    let timeout_ms = match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberStream
////////////////////////////////////////////////////////////////////////////////

/// A byte stream over any descriptor, read and written cooperatively.
///
/// Adopting a descriptor registers it with the fd table and forces the
/// system non-blocking flag. Dropping the stream closes the descriptor and
/// cancels parked operations on it.
#[derive(Debug)]
pub struct FiberStream {
    fd: RawFd,
}

impl FiberStream {
    /// Adopt any fd-like object.
    pub fn new<T>(inner: T) -> io::Result<FiberStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        let ctx = match fd_manager().get(fd, true) {
            Some(ctx) => ctx,
            None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };
        ctx.force_sys_nonblock();
        Ok(FiberStream { fd })
    }

    /// Connect to a remote TCP endpoint and adopt the socket.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<FiberStream> {
        Self::new(TcpStream::connect(addr)?)
    }

    /// Opens a TCP connection to a remote host with a timeout.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> io::Result<FiberStream> {
        Self::new(TcpStream::connect_timeout(addr, timeout)?)
    }

    /// Per-descriptor read timeout used when a call passes none.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        if let Some(ctx) = fd_manager().get(self.fd, true) {
            ctx.set_timeout(Direction::Read, timeout);
        }
    }

    /// Per-descriptor write timeout used when a call passes none.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        if let Some(ctx) = fd_manager().get(self.fd, true) {
            ctx.set_timeout(Direction::Write, timeout);
        }
    }

    /// Opt into manual non-blocking semantics: cooperative calls surface
    /// `WouldBlock` instead of parking the fiber. The OS-level flag is
    /// unaffected (the runtime keeps it set either way).
    pub fn set_nonblocking(&self, nonblocking: bool) {
        if let Some(ctx) = fd_manager().get(self.fd, true) {
            ctx.set_user_nonblock(nonblocking);
        }
    }

    /// Pull some bytes from the stream, parking on `EAGAIN`.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.fd, buf, None)
    }

    /// Pull some bytes with an explicit timeout overriding the descriptor's.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        read(self.fd, buf, timeout)
    }

    /// Write a buffer into the stream, parking on `EAGAIN`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        write(self.fd, buf, None)
    }

    /// Write a buffer with an explicit timeout overriding the descriptor's.
    pub fn write_with_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        write(self.fd, buf, timeout)
    }
}

impl AsRawFd for FiberStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for FiberStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Read for FiberStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FiberStream::read(self, buf)
    }
}

impl Write for FiberStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FiberStream::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FiberStream {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP listener whose `accept` parks the calling fiber instead of
/// blocking its thread.
#[derive(Debug)]
pub struct FiberListener {
    inner: TcpListener,
}

impl FiberListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<FiberListener> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(FiberListener { inner })
    }

    /// Accept a new incoming connection. The accepted stream starts with
    /// the configured default read timeout.
    pub fn accept(&self) -> io::Result<(FiberStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    let stream = FiberStream::new(stream)?;
                    stream.set_read_timeout(Some(Duration::from_millis(
                        config::global().stream_read_timeout_ms,
                    )));
                    return Ok((stream, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait(self.inner.as_raw_fd(), Direction::Read, None)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

impl std::convert::TryFrom<TcpListener> for FiberListener {
    type Error = io::Error;

    fn try_from(value: TcpListener) -> io::Result<Self> {
        value.set_nonblocking(true)?;
        Ok(FiberListener { inner: value })
    }
}
