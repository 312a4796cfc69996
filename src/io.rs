//! Event-driven extension of the scheduler.
//!
//! An [`IoManager`] is a [`Scheduler`] whose idle phase is an epoll loop:
//! it registers interest in descriptor readiness, parks a fiber (or a
//! callback) on it, and resumes it when the OS reports the descriptor
//! ready. A [`TimerManager`] is folded into the same loop so the event
//! wait never sleeps past the next deadline.
//!
//! Registrations are edge-triggered: a resumed reader/writer is expected to
//! loop until `EAGAIN` before parking again (the wrappers in
//! [`stream`](crate::stream) do).
//!
//! Per descriptor the manager keeps one [`FdContext`] cell in a dense
//! vector indexed by the raw fd. The vector's rwlock only guards growth;
//! each cell's mutex serializes event-mask edits, and `epoll_ctl` for an fd
//! is only ever issued under that cell's lock.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use once_cell::sync::OnceCell;

use crate::config;
use crate::error::{Error, Result};
use crate::fiber::{self, Fiber};
use crate::scheduler::{self, Callable, Scheduler, SchedulerCore, SchedulerHooks};
use crate::timer::{Timer, TimerManager};

/// Events fetched per `epoll_wait` round.
const EVENTS_PER_WAIT: usize = 64;

/// Initial size of the fd-context table.
const INITIAL_CONTEXTS: usize = 32;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;

bitflags! {
    /// Registered interest mask of one descriptor. The bit values match
    /// `EPOLLIN`/`EPOLLOUT` so the mask feeds `epoll_ctl` directly.
    pub(crate) struct Events: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// One of the two waitable directions of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    #[inline]
    pub(crate) fn mask(self) -> Events {
        match self {
            Direction::Read => Events::READ,
            Direction::Write => Events::WRITE,
        }
    }
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoShared>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// FdContext
////////////////////////////////////////////////////////////////////////////////

enum Continuation {
    Fiber(Arc<Fiber>),
    Call(Callable),
}

/// The parked continuation of one direction: which scheduler to resume on
/// and what to resume.
struct EventSlot {
    sched: Weak<SchedulerCore>,
    cont: Continuation,
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

#[derive(Default)]
struct FdEvents {
    events: Events,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl Default for Events {
    fn default() -> Self {
        Events::empty()
    }
}

impl FdEvents {
    fn slot_mut(&mut self, direction: Direction) -> &mut Option<EventSlot> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdEvents::default()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoShared
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct IoShared {
    epfd: RawFd,
    tickle_rx: RawFd,
    tickle_tx: RawFd,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    sched: Weak<SchedulerCore>,
    timers: TimerManager,
    idle_timeout_ms: u64,
    hooks: OnceCell<Weak<IoHooks>>,
}

impl IoShared {
    /// Table capacity after growing for `fd`: half again as large, never
    /// smaller than the initial size, always covering `fd` itself.
    fn grow_capacity(fd: usize) -> usize {
        INITIAL_CONTEXTS.max(fd + 1).max((fd * 3 + 1) / 2)
    }

    fn context_for(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let contexts = self.contexts.read().expect("fd table lock poisoned");
            if index < contexts.len() {
                return Some(contexts[index].clone());
            }
        }
        if !create {
            return None;
        }
        let mut contexts = self.contexts.write().expect("fd table lock poisoned");
        if index >= contexts.len() {
            let target = Self::grow_capacity(index);
            let mut next = contexts.len() as RawFd;
            contexts.resize_with(target, || {
                let ctx = Arc::new(FdContext::new(next));
                next += 1;
                ctx
            });
        }
        Some(contexts[index].clone())
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: Option<Events>) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: 0,
            u64: fd as u64,
        };
        if let Some(events) = events {
            ev.events = EPOLLET | events.bits();
        }
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            let ev_events = ev.events;
            log::error!(
                "epoll_ctl(epfd {}, op {}, fd {}, events {:#x}): {}",
                self.epfd,
                op,
                fd,
                ev_events,
                err
            );
            return Err(Error::Io(err));
        }
        Ok(())
    }

    fn add_event(&self, fd: RawFd, direction: Direction, cb: Option<Callable>) -> Result<()> {
        let ctx = match self.context_for(fd, true) {
            Some(ctx) => ctx,
            None => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid fd {}", fd),
                )))
            }
        };

        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        let mask = direction.mask();
        if inner.events.contains(mask) {
            log::error!(
                "add_event: fd {} {:?} already registered (mask {:?})",
                fd,
                direction,
                inner.events
            );
            return Err(Error::EventExists { fd, direction });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_ctl(op, fd, Some(inner.events | mask))?;

        inner.events |= mask;
        self.pending.fetch_add(1, Ordering::AcqRel);

        // Resume on the scheduler of the registering thread when there is
        // one, else on the owning scheduler.
        let sched = match scheduler::current_core() {
            Some(core) => Arc::downgrade(&core),
            None => self.sched.clone(),
        };
        let cont = match cb {
            Some(cb) => Continuation::Call(cb),
            None => {
                let cur = fiber::current()
                    .expect("add_event without a callback must run on a fiber");
                Continuation::Fiber(cur)
            }
        };
        debug_assert!(inner.slot_mut(direction).is_none());
        *inner.slot_mut(direction) = Some(EventSlot { sched, cont });
        Ok(())
    }

    fn del_event(&self, fd: RawFd, direction: Direction) -> bool {
        self.remove_event(fd, direction, false)
    }

    fn cancel_event(&self, fd: RawFd, direction: Direction) -> bool {
        self.remove_event(fd, direction, true)
    }

    /// Drop (or, for a cancellation, trigger) one direction's registration.
    fn remove_event(&self, fd: RawFd, direction: Direction, trigger: bool) -> bool {
        let ctx = match self.context_for(fd, false) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        let mask = direction.mask();
        if !inner.events.contains(mask) {
            return false;
        }

        let left = inner.events - mask;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let events = if left.is_empty() { None } else { Some(left) };
        if self.epoll_ctl(op, fd, events).is_err() {
            return false;
        }

        inner.events = left;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        let slot = inner.slot_mut(direction).take();
        if trigger {
            if let Some(slot) = slot {
                self.run_continuation(slot);
            }
        }
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.context_for(fd, false) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");
        if inner.events.is_empty() {
            return false;
        }
        if self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, None).is_err() {
            return false;
        }
        inner.events = Events::empty();
        for direction in [Direction::Read, Direction::Write] {
            if let Some(slot) = inner.slot_mut(direction).take() {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.run_continuation(slot);
            }
        }
        true
    }

    /// Hand a parked continuation back to its scheduler.
    fn run_continuation(&self, slot: EventSlot) {
        let core = match slot.sched.upgrade().or_else(|| self.sched.upgrade()) {
            Some(core) => core,
            None => {
                log::warn!("dropping a parked continuation: scheduler is gone");
                return;
            }
        };
        match slot.cont {
            Continuation::Fiber(f) => core.push_fiber(f),
            Continuation::Call(cb) => core.push_call(cb),
        }
    }

    /// Readiness reported for `fd`: trigger the registered directions and
    /// re-issue the leftover interest.
    fn dispatch_ready(&self, fd: RawFd, mut bits: u32) {
        let ctx = match self.context_for(fd, false) {
            Some(ctx) => ctx,
            None => return,
        };
        let mut inner = ctx.inner.lock().expect("fd context lock poisoned");

        // An error or hangup wakes both directions so the parked fibers can
        // observe it from the syscall retry.
        if bits & (EPOLLERR | EPOLLHUP) != 0 {
            bits |= EPOLLIN | EPOLLOUT;
        }
        let mut real = Events::empty();
        if bits & EPOLLIN != 0 {
            real |= Events::READ;
        }
        if bits & EPOLLOUT != 0 {
            real |= Events::WRITE;
        }
        if (inner.events & real).is_empty() {
            return;
        }

        let left = inner.events - real;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let events = if left.is_empty() { None } else { Some(left) };
        if self.epoll_ctl(op, ctx.fd, events).is_err() {
            return;
        }

        for direction in [Direction::Read, Direction::Write] {
            if real.contains(direction.mask()) && inner.events.contains(direction.mask()) {
                inner.events -= direction.mask();
                if let Some(slot) = inner.slot_mut(direction).take() {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    self.run_continuation(slot);
                }
            }
        }
    }

    /// Gated wakeup: skip the pipe write when no worker sleeps in the
    /// event wait.
    fn tickle(&self) {
        let core = match self.sched.upgrade() {
            Some(core) => core,
            None => return,
        };
        if core.idle_workers() == 0 {
            return;
        }
        self.tickle_write();
    }

    fn tickle_write(&self) {
        let rc = unsafe { libc::write(self.tickle_tx, b"T".as_ptr() as *const libc::c_void, 1) };
        if rc != 1 {
            // A full pipe already holds an undelivered wakeup.
            log::trace!("tickle write skipped: {}", std::io::Error::last_os_error());
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(
                    self.tickle_rx,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }

    fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl Drop for IoShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_rx);
            libc::close(self.tickle_tx);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoHooks
////////////////////////////////////////////////////////////////////////////////

/// Scheduler hooks that replace the bare condvar idle with the event loop.
struct IoHooks {
    shared: Arc<IoShared>,
}

impl SchedulerHooks for IoHooks {
    fn tickle(&self) {
        self.shared.tickle();
    }

    fn stopping(&self) -> bool {
        match self.shared.sched.upgrade() {
            None => true,
            Some(core) => {
                core.base_stopping()
                    && self.shared.pending_events() == 0
                    && !self.shared.timers.has_timer()
            }
        }
    }

    fn on_thread_start(&self) {
        CURRENT_IO.with(|io| *io.borrow_mut() = Some(Arc::downgrade(&self.shared)));
    }

    /// The event loop. Runs inside each worker's idle fiber; yields back to
    /// the dispatch loop after every round so newly scheduled continuations
    /// get picked up.
    fn idle(&self) {
        let shared = &self.shared;
        let core = match shared.sched.upgrade() {
            Some(core) => core,
            None => return,
        };
        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            EVENTS_PER_WAIT
        ];

        loop {
            if self.stopping() {
                log::info!("iomanager {} idle exiting", core.name());
                break;
            }

            // A task can land between the dispatcher's last queue scan and
            // this point, before the producer could observe an idle worker
            // to tickle. Hand the thread back rather than sleep on it.
            if core.has_queued() {
                fiber::yield_to_hold();
                continue;
            }

            let wait_ms = shared
                .timers
                .next_expiry_ms()
                .min(shared.idle_timeout_ms)
                .min(i32::MAX as u64) as i32;

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        shared.epfd,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        wait_ms,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait(epfd {}): {}", shared.epfd, err);
                break 0;
            };

            for ev in &events[..n] {
                if ev.u64 == shared.tickle_rx as u64 {
                    shared.drain_tickle();
                    continue;
                }
                shared.dispatch_ready(ev.u64 as RawFd, ev.events);
            }

            let mut expired = Vec::new();
            shared.timers.drain_expired(&mut expired);
            for cb in expired {
                core.push_call(Box::new(move || cb()));
            }

            fiber::yield_to_hold();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoManager
////////////////////////////////////////////////////////////////////////////////

/// Scheduler + event loop + timers. Clones share the same runtime.
///
/// Construction starts the worker pool. [`stop`](Self::stop) drains the
/// queue, pending events and timers, then joins the workers; it must be
/// called from outside the pool.
#[derive(Clone)]
pub struct IoManager {
    scheduler: Scheduler,
    shared: Arc<IoShared>,
    // Keeps the hook object alive between construction and worker startup.
    hooks: Arc<IoHooks>,
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Self> {
        let scheduler = Scheduler::new(threads, use_caller, name);
        let cfg = config::global();

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(Error::Io(err));
        }

        let timers = TimerManager::new();
        let shared = Arc::new(IoShared {
            epfd,
            tickle_rx: pipe_fds[0],
            tickle_tx: pipe_fds[1],
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            sched: Arc::downgrade(scheduler.core()),
            timers: timers.clone(),
            idle_timeout_ms: cfg.io_idle_timeout_ms,
            hooks: OnceCell::new(),
        });

        // The tickle pipe is the one registration that lives for the whole
        // runtime: edge-triggered readability on the read end.
        shared.epoll_ctl(
            libc::EPOLL_CTL_ADD,
            shared.tickle_rx,
            Some(Events::READ),
        )?;
        // Pre-size the fd table to its initial capacity.
        let _ = shared.context_for(0, true);

        let hooks = Arc::new(IoHooks {
            shared: shared.clone(),
        });
        shared
            .hooks
            .set(Arc::downgrade(&hooks))
            .unwrap_or_else(|_| unreachable!("hooks installed twice"));
        let hooks_trait: Arc<dyn SchedulerHooks> = hooks.clone();
        let hooks_dyn: Weak<dyn SchedulerHooks> = Arc::downgrade(&hooks_trait);
        scheduler.set_hooks(hooks_dyn);

        let front = Arc::downgrade(&shared);
        timers.set_front_hook(Box::new(move || {
            if let Some(shared) = front.upgrade() {
                shared.tickle();
            }
        }));

        scheduler.start();
        log::debug!("iomanager {} running (epfd {})", scheduler.name(), epfd);
        Ok(Self {
            scheduler,
            shared,
            hooks,
        })
    }

    /// The I/O manager owning the calling worker thread, if any.
    pub fn current() -> Option<IoManager> {
        let shared = CURRENT_IO.with(|io| io.borrow().as_ref().and_then(Weak::upgrade))?;
        let hooks = shared.hooks.get()?.upgrade()?;
        let core = shared.sched.upgrade()?;
        Some(IoManager {
            scheduler: Scheduler::from_core(core),
            shared,
            hooks,
        })
    }

    /// Handle to the underlying scheduler.
    #[inline]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Enqueue a callable onto the pool.
    #[inline]
    pub fn schedule<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f)
    }

    /// Enqueue a fiber onto the pool.
    #[inline]
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) -> Result<()> {
        self.scheduler.schedule_fiber(fiber)
    }

    /// Park the current fiber on `direction` readiness of `fd`.
    ///
    /// Precondition: no event is registered for that direction on this fd.
    /// The fiber must yield to HOLD right after; the readiness event (or a
    /// cancellation) re-schedules it.
    pub fn add_event(&self, fd: RawFd, direction: Direction) -> Result<()> {
        self.shared.add_event(fd, direction, None)
    }

    /// Register a callback on `direction` readiness of `fd` instead of
    /// parking a fiber.
    pub fn add_event_with<F>(&self, fd: RawFd, direction: Direction, cb: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.add_event(fd, direction, Some(Box::new(cb)))
    }

    /// Remove a registration without firing the continuation. Returns
    /// whether anything was removed.
    pub fn del_event(&self, fd: RawFd, direction: Direction) -> bool {
        self.shared.del_event(fd, direction)
    }

    /// Remove a registration and schedule its parked continuation.
    pub fn cancel_event(&self, fd: RawFd, direction: Direction) -> bool {
        self.shared.cancel_event(fd, direction)
    }

    /// Cancel both directions of `fd`, if registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.shared.cancel_all(fd)
    }

    /// One-shot timer expiring `delay` from now.
    pub fn add_timer<F>(&self, delay: Duration, cb: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.timers.add_timer(delay, cb, false)
    }

    /// Periodic timer firing every `interval`.
    pub fn add_recurring_timer<F>(&self, interval: Duration, cb: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.timers.add_timer(interval, cb, true)
    }

    /// Timer whose callback is a no-op once `cond` has no strong
    /// references left.
    pub fn add_conditional_timer<F, T>(
        &self,
        delay: Duration,
        cb: F,
        cond: &Arc<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.shared
            .timers
            .add_conditional_timer(delay, cb, cond, recurring)
    }

    /// Number of event registrations currently parked.
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.shared.pending_events()
    }

    /// Drain remaining work, pending events and timers, then join the
    /// workers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.scheduler.name())
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_capacity_is_half_again() {
        assert_eq!(IoShared::grow_capacity(100), 150);
        assert_eq!(IoShared::grow_capacity(1000), 1500);
        // Small descriptors land on the initial size.
        assert_eq!(IoShared::grow_capacity(0), 32);
        assert_eq!(IoShared::grow_capacity(20), 32);
        // The grown table always covers the descriptor itself.
        assert!(IoShared::grow_capacity(33) > 33);
    }

    #[test]
    fn direction_masks_match_epoll_bits() {
        assert_eq!(Direction::Read.mask().bits(), EPOLLIN);
        assert_eq!(Direction::Write.mask().bits(), EPOLLOUT);
    }
}
