//! Cooperative multitasking module.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns a stack, suspends itself explicitly and is resumed explicitly.
//! With this module you can:
//! - create fibers over a callable with [`Builder`] or [`Fiber::new`],
//! - resume them and yield out of them ([`Fiber::resume`],
//!   [`yield_to_hold`], [`yield_to_ready`]),
//! - put the current fiber to sleep without blocking its thread
//!   ([`sleep`]).
//!
//! A fiber moves through the states of [`State`]:
//!
//! ```text
//! INIT -> EXEC -> (HOLD | READY | TERM | EXCEPT)
//! HOLD -> READY -> EXEC      (re-scheduled)
//! TERM/EXCEPT: terminal (reusable through reset)
//! ```
//!
//! Exactly one fiber per OS thread is in EXEC at a time. A fiber in HOLD is
//! kept alive only by whatever external registration (I/O event, timer,
//! explicit schedule) will resume it. Resuming or resetting a fiber outside
//! its legal states is a programming error and panics.

use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod context;
mod stack;

pub use stack::MIN_STACK_SIZE;

use crate::config;
use crate::error::{Error, Result};
use context::Context;
use stack::Stack;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static ROOT_CONTEXT: RefCell<Option<Box<Context>>> = RefCell::new(None);
}

/// Context representing this thread's entry into fiber execution; created
/// lazily so `yield` always has somewhere to return to.
fn root_context_ptr() -> *mut Context {
    ROOT_CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(Box::new(Context::empty()));
        }
        &mut **slot.as_mut().expect("just initialized") as *mut Context
    })
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// The fiber state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created or reset, never entered.
    Init = 0,
    /// Runnable, waiting in a ready queue.
    Ready = 1,
    /// Executing on some thread right now.
    Exec = 2,
    /// Parked, awaiting an external resumption.
    Hold = 3,
    /// The callable returned normally.
    Term = 4,
    /// The callable panicked; the stack is unwound, the payload captured.
    Except = 5,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", raw),
        }
    }
}

/// How a fiber's activation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberExit {
    /// The callable ran to completion.
    Terminated,
    /// The callable panicked; the message is the stringified payload.
    Panicked(String),
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A stackful cooperative task.
///
/// Shared ownership (`Arc`) keeps a parked fiber alive across the ready
/// queue and event registrations until it is resumed exactly once.
pub struct Fiber {
    id: u64,
    name: String,
    stack: Stack,
    ctx: UnsafeCell<Context>,
    state: AtomicU8,
    /// Whether the saving `swapcontext` of the last suspension has completed
    /// and the machine context may be entered by another thread.
    switched_out: AtomicBool,
    callable: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
    exit: Mutex<Option<FiberExit>>,
}

// Safety: the machine context, stack and callable are only ever touched by
// the thread currently holding resumption rights. The handoff between
// threads is ordered by `state` and `switched_out` (release on suspend,
// acquire before the next resume).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber over `f` with default attributes. The initial state is
    /// INIT; nothing runs until the first [`resume`](Self::resume).
    #[inline]
    pub fn new<F>(f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Builder::new().spawn(f)
    }

    fn with_parts<F>(name: Option<String>, stack_size: usize, f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::new(stack_size).map_err(Error::Io)?;
        let mut ctx = Context::empty();
        ctx.make(&stack, fiber_entry);

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id,
            name: name.unwrap_or_else(|| format!("fiber/{}", id)),
            stack,
            ctx: UnsafeCell::new(ctx),
            state: AtomicU8::new(State::Init as u8),
            switched_out: AtomicBool::new(true),
            callable: UnsafeCell::new(Some(Box::new(f))),
            exit: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::trace!("fiber {} ({}) created", fiber.id, fiber.name);
        Ok(fiber)
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// How the last activation ended, once the fiber reached TERM or EXCEPT.
    pub fn exit_status(&self) -> Option<FiberExit> {
        self.exit.lock().expect("exit lock poisoned").clone()
    }

    /// Switch execution to this fiber, consuming the caller's handle (the
    /// resumption right travels with it; keep a clone to inspect the state
    /// afterwards).
    ///
    /// Preconditions: the fiber is in INIT, READY or HOLD and no fiber is
    /// executing on this thread (resumption always happens from the
    /// thread's dispatch context).
    ///
    /// Returns the state the fiber suspended itself with. Dispatchers must
    /// branch on this return value: once the suspension is published,
    /// another thread may already be resuming the fiber, so a fresh
    /// [`state()`](Self::state) read can race.
    pub fn resume(self: Arc<Self>) -> State {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Ready | State::Hold),
            "resume on a fiber in state {:?}",
            state
        );
        assert!(
            current().is_none(),
            "resume must be called from the dispatch context, not from a fiber"
        );

        // A continuation may be triggered on another thread before the
        // suspending swapcontext over there has finished saving registers.
        // Wait for the previous owner to publish the context.
        while !self.switched_out.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        self.switched_out.store(false, Ordering::Relaxed);

        self.set_state(State::Exec);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));

        let root = root_context_ptr();
        // Safety: the context was prepared by `make` or saved by a completed
        // suspension (gated on `switched_out` above); nothing else runs on
        // this stack.
        unsafe {
            Context::swap(root, self.ctx.get());
        }

        CURRENT.with(|c| *c.borrow_mut() = None);
        // Sample before publishing: afterwards the fiber may belong to
        // another thread.
        let state = self.state();
        self.switched_out.store(true, Ordering::Release);
        state
    }

    /// Reinitialize the context over the existing stack with a new callable.
    ///
    /// Only legal in INIT, TERM or EXCEPT. Afterwards the fiber behaves
    /// exactly like a freshly constructed one over the same stack.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "reset on a fiber in state {:?}",
            state
        );
        // Safety: terminal/initial state means no thread is executing on the
        // stack and nobody else holds resumption rights.
        unsafe {
            *self.callable.get() = Some(Box::new(f));
            (*self.ctx.get()).make(&self.stack, fiber_entry);
        }
        *self.exit.lock().expect("exit lock poisoned") = None;
        self.switched_out.store(true, Ordering::Release);
        self.set_state(State::Init);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        debug_assert!(
            self.state() != State::Exec,
            "fiber dropped while executing"
        );
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        log::trace!("fiber {} ({}) destroyed", self.id, self.name);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Entry point of every fiber activation. Runs the callable under a panic
/// guard, records the outcome and swaps back to the dispatch context.
extern "C" fn fiber_entry() {
    let fiber: *const Fiber = {
        let cur = current().expect("fiber entry without a current fiber");
        Arc::as_ptr(&cur)
        // The Arc clone is dropped here; the thread-local CURRENT slot keeps
        // the fiber alive for the whole activation. Holding an Arc on this
        // stack would leak it: this frame is abandoned, not unwound.
    };
    // Safety: see above.
    let fiber = unsafe { &*fiber };

    let callable = unsafe { (*fiber.callable.get()).take() }
        .expect("fiber entered without a callable");

    match panic::catch_unwind(AssertUnwindSafe(callable)) {
        Ok(()) => {
            *fiber.exit.lock().expect("exit lock poisoned") = Some(FiberExit::Terminated);
            fiber.set_state(State::Term);
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            log::error!("fiber {} ({}) panicked: {}", fiber.id, fiber.name, msg);
            *fiber.exit.lock().expect("exit lock poisoned") = Some(FiberExit::Panicked(msg));
            fiber.set_state(State::Except);
        }
    }

    let ctx = fiber.ctx.get();
    let root = root_context_ptr();
    // Safety: swapping back to the context that resumed us; this stack is
    // never entered again without a reset.
    unsafe {
        Context::swap(ctx, root);
    }
    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber. Methods can be chained on it in order to configure it.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be; shows up in logs and panics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. Rounded up
    /// to [`MIN_STACK_SIZE`] and to a page boundary at allocation time.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "fiber stack size must be non-zero",
            )));
        }
        self.stack_size = Some(stack_size);
        Ok(self)
    }

    /// Allocate the stack and build the fiber in INIT state.
    pub fn spawn<F>(self, f: F) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = self
            .stack_size
            .unwrap_or_else(|| config::global().fiber_stack_size);
        Fiber::with_parts(self.name, stack_size, f)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// The fiber currently executing on this thread, if any.
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Id of the fiber currently executing on this thread, or 0 when called
/// from a thread's root context.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id()).unwrap_or(0))
}

/// Number of fibers currently alive in the process (created minus
/// destroyed).
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Suspend the current fiber into HOLD and switch back to the dispatch
/// context. The fiber will run again only when something (an I/O event, a
/// timer, an explicit schedule) hands it back to a scheduler.
///
/// A fiber that parks itself with no external registration in place stays
/// parked; the runtime does not prevent it, but pending-fiber diagnostics
/// ([`total_fibers`], scheduler logs) make it visible.
pub fn yield_to_hold() {
    yield_with(State::Hold);
}

/// Suspend the current fiber into READY and switch back to the dispatch
/// context; the dispatcher re-enqueues it, so it runs again shortly.
pub fn yield_to_ready() {
    yield_with(State::Ready);
}

fn yield_with(state: State) {
    let cur = current().expect("yield outside of a fiber");
    debug_assert_eq!(cur.state(), State::Exec);
    cur.set_state(state);
    let ctx = cur.ctx.get();
    // The thread-local CURRENT slot keeps the fiber alive until the
    // dispatcher regains control; no extra handle is needed across the
    // suspension.
    drop(cur);
    let root = root_context_ptr();
    // Safety: swapping from the executing fiber to the context that resumed
    // it; the pointers stay valid because CURRENT keeps the fiber alive
    // until the dispatcher regains control.
    unsafe {
        Context::swap(ctx, root);
    }
}

/// Put the current fiber to sleep for at least `timeout` without blocking
/// its thread: a one-shot timer re-schedules the fiber and the fiber parks.
///
/// Called from outside a runtime this degrades to `std::thread::sleep`.
pub fn sleep(timeout: Duration) {
    let io = crate::io::IoManager::current();
    let cur = current();
    match (io, cur) {
        (Some(io), Some(cur)) => {
            let sched = io.scheduler();
            let fiber = cur.clone();
            io.add_timer(timeout, move || {
                if let Err(e) = sched.schedule_fiber(fiber.clone()) {
                    log::warn!("sleep wakeup for fiber {} dropped: {}", fiber.id(), e);
                }
            });
            yield_to_hold();
        }
        _ => std::thread::sleep(timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn resume_runs_the_callable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let fiber = Fiber::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(fiber.state(), State::Init);
        fiber.clone().resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(fiber.exit_status(), Some(FiberExit::Terminated));
    }

    #[test]
    fn yield_to_ready_round_trip() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let fiber = Fiber::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
            yield_to_ready();
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        fiber.clone().resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Ready);

        // Control returns to the statement after the yield.
        fiber.clone().resume();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn hold_requires_external_resume() {
        let fiber = Fiber::new(|| {
            yield_to_hold();
        })
        .unwrap();
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Hold);
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panicking_fiber_goes_to_except() {
        let fiber = Fiber::new(|| {
            panic!("boom");
        })
        .unwrap();
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Except);
        assert_eq!(
            fiber.exit_status(),
            Some(FiberExit::Panicked("boom".to_string()))
        );
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        let fiber = Fiber::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Term);

        let hits3 = hits.clone();
        fiber.reset(move || {
            hits3.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Init);
        assert_eq!(fiber.exit_status(), None);
        fiber.clone().resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_after_panic() {
        let fiber = Fiber::new(|| panic!("first run")).unwrap();
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Except);

        fiber.reset(|| {});
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(fiber.exit_status(), Some(FiberExit::Terminated));
    }

    #[test]
    fn current_id_tracks_execution() {
        assert_eq!(current_id(), 0);
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let fiber = Fiber::new(move || {
            seen2.store(current_id(), Ordering::SeqCst);
        })
        .unwrap();
        let id = fiber.id();
        fiber.clone().resume();
        assert_eq!(seen.load(Ordering::SeqCst), id);
        assert_eq!(current_id(), 0);
    }

    #[test]
    fn builder_rejects_zero_stack() {
        assert!(Builder::new().stack_size(0).is_err());
    }

    #[test]
    fn builder_names_the_fiber() {
        let fiber = Builder::new()
            .name("worker")
            .spawn(|| {})
            .unwrap();
        assert_eq!(fiber.name(), "worker");
        fiber.resume();
    }

    #[test]
    fn small_stack_still_runs() {
        let fiber = Builder::new()
            .stack_size(MIN_STACK_SIZE)
            .unwrap()
            .spawn(|| {
                let data = [0u8; 1024];
                assert_eq!(data.iter().sum::<u8>(), 0);
            })
            .unwrap();
        fiber.clone().resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn sleep_off_runtime_blocks_the_thread() {
        let start = std::time::Instant::now();
        sleep(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
