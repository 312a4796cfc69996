//! The M:N dispatcher: multiplexes ready fibers and callable work onto a
//! fixed pool of OS threads.
//!
//! Each worker runs a cooperative dispatch loop: pop a task whose thread
//! affinity matches, resume its fiber (materializing one on demand for a
//! raw callable), and run it until it yields or terminates. With an empty
//! queue the worker enters its *idle fiber*; the bare scheduler's idle
//! parks on a condvar, the I/O manager replaces it with an `epoll_wait`
//! loop through [`SchedulerHooks`].
//!
//! Any blocking primitive invoked on a fiber suspends only that fiber,
//! never its thread; the dispatch loop below is the thread's home between
//! fiber activations.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::fiber::{self, Builder, Fiber, State};
use crate::thread::Thread;

pub(crate) type Callable = Box<dyn FnOnce() + Send + 'static>;

/// How long the bare idle fiber naps between stop-predicate re-checks.
const IDLE_NAP: Duration = Duration::from_millis(50);

enum Job {
    Fiber(Arc<Fiber>),
    Call(Callable),
}

/// A scheduling unit: a fiber or a not-yet-materialized callable, plus an
/// optional target thread.
struct Task {
    job: Job,
    thread: Option<usize>,
}

/// Hooks through which an outer layer (the I/O manager) replaces the bare
/// scheduler's wake/idle/stop behavior.
pub(crate) trait SchedulerHooks: Send + Sync {
    /// Wake at least one worker blocked in the idle phase.
    fn tickle(&self);
    /// Body of every worker's idle fiber; must yield between rounds and
    /// return when stopping.
    fn idle(&self);
    /// Extended stopping predicate.
    fn stopping(&self) -> bool;
    /// Runs on each worker thread before dispatch starts.
    fn on_thread_start(&self);
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Weak<SchedulerCore>>> = RefCell::new(None);
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// SchedulerCore
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct SchedulerCore {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    idle_cond: Condvar,
    threads: Mutex<Vec<Thread>>,
    /// Dispatch threads, the calling thread included in use-caller mode.
    thread_count: usize,
    use_caller: bool,
    started: AtomicBool,
    stop_requested: AtomicBool,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    hooks: OnceCell<Weak<dyn SchedulerHooks>>,
}

impl SchedulerCore {
    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.get().and_then(Weak::upgrade)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self
            .queue
            .lock()
            .expect("scheduler queue lock poisoned")
            .is_empty()
    }

    fn push(self: &Arc<Self>, task: Task, external: bool) -> Result<()> {
        // Internal pushes (continuations, READY re-enqueues) must drain even
        // while stopping; only new outside work is rejected.
        if external && self.stop_requested.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let was_empty = {
            let mut queue = self.queue.lock().expect("scheduler queue lock poisoned");
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if was_empty {
            self.tickle();
        }
        Ok(())
    }

    pub(crate) fn push_fiber(self: &Arc<Self>, f: Arc<Fiber>) {
        let _ = self.push(
            Task {
                job: Job::Fiber(f),
                thread: None,
            },
            false,
        );
    }

    pub(crate) fn push_call(self: &Arc<Self>, cb: Callable) {
        let _ = self.push(
            Task {
                job: Job::Call(cb),
                thread: None,
            },
            false,
        );
    }

    pub(crate) fn tickle(&self) {
        if let Some(hooks) = self.hooks() {
            hooks.tickle();
        } else {
            self.idle_cond.notify_all();
        }
    }

    /// Auto-stop signaled, queue drained and no worker mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self
                .queue
                .lock()
                .expect("scheduler queue lock poisoned")
                .is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    fn stopping(&self) -> bool {
        match self.hooks() {
            Some(hooks) => hooks.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Idle body of the bare scheduler: nap until work or stop shows up.
    fn bare_idle(&self) {
        loop {
            if self.base_stopping() {
                break;
            }
            {
                let queue = self.queue.lock().expect("scheduler queue lock poisoned");
                if queue.is_empty() {
                    let _ = self
                        .idle_cond
                        .wait_timeout(queue, IDLE_NAP)
                        .expect("scheduler queue lock poisoned");
                }
            }
            fiber::yield_to_hold();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

/// Handle to a scheduler. Clones share the same pool.
///
/// Lifecycle: [`start`](Self::start) spawns the workers, [`stop`](Self::stop)
/// signals auto-stop, drains remaining work and joins them. `stop` must be
/// called from outside the pool (in use-caller mode: from the constructing
/// thread, which then participates in the drain).
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// A scheduler over `threads` dispatch threads. With `use_caller` the
    /// calling thread counts as one of them: it joins the dispatch when
    /// `stop` drains the queue, so only `threads - 1` workers are spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Self {
        assert!(threads > 0, "scheduler needs at least one thread");
        Self {
            core: Arc::new(SchedulerCore {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                idle_cond: Condvar::new(),
                threads: Mutex::new(Vec::new()),
                thread_count: threads,
                use_caller,
                started: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                hooks: OnceCell::new(),
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.core
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        if self.core.hooks.set(hooks).is_err() {
            panic!("scheduler hooks installed twice");
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Number of dispatch threads (the caller included in use-caller mode).
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.core.thread_count
    }

    /// Spawn the worker threads. Idempotent once started.
    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let spawn_count = self.core.thread_count - usize::from(self.core.use_caller);
        let mut threads = self
            .core
            .threads
            .lock()
            .expect("scheduler threads lock poisoned");
        for id in 0..spawn_count {
            let core = self.core.clone();
            let thread_name = format!("{}_{}", self.core.name, id);
            let handle = Thread::spawn(&thread_name, move || run(core, id))
                .expect("failed to spawn a scheduler worker");
            threads.push(handle);
        }
        log::debug!(
            "scheduler {} started: {} worker(s), use_caller = {}",
            self.core.name,
            spawn_count,
            self.core.use_caller
        );
    }

    /// Signal auto-stop, wake idle workers, drain and join.
    ///
    /// In use-caller mode the calling thread runs the dispatch loop here
    /// until the queue (and, under an I/O manager, pending events and
    /// timers) is drained. After `stop` returns, `schedule` is rejected
    /// with [`Error::Stopped`].
    pub fn stop(&self) {
        self.core.stop_requested.store(true, Ordering::Release);
        if !self.core.started.load(Ordering::Acquire) {
            return;
        }
        for _ in 0..self.core.thread_count {
            self.core.tickle();
        }

        if self.core.use_caller {
            // The caller-thread dispatcher drives remaining work.
            run(self.core.clone(), self.core.thread_count - 1);
        }

        let threads: Vec<Thread> = self
            .core
            .threads
            .lock()
            .expect("scheduler threads lock poisoned")
            .drain(..)
            .collect();
        for thread in threads {
            thread.join();
        }
        log::debug!("scheduler {} stopped", self.core.name);
    }

    /// True once auto-stop has been signaled and all work has drained.
    pub fn stopping(&self) -> bool {
        self.core.stopping()
    }

    /// Enqueue a callable for any worker.
    pub fn schedule<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push(
            Task {
                job: Job::Call(Box::new(f)),
                thread: None,
            },
            true,
        )
    }

    /// Enqueue a callable for a specific worker thread.
    pub fn schedule_to<F>(&self, thread: usize, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.check_thread(thread)?;
        self.core.push(
            Task {
                job: Job::Call(Box::new(f)),
                thread: Some(thread),
            },
            true,
        )
    }

    /// Enqueue a fiber for any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) -> Result<()> {
        self.core.push(
            Task {
                job: Job::Fiber(fiber),
                thread: None,
            },
            true,
        )
    }

    /// Enqueue a fiber for a specific worker thread.
    pub fn schedule_fiber_to(&self, thread: usize, fiber: Arc<Fiber>) -> Result<()> {
        self.check_thread(thread)?;
        self.core.push(
            Task {
                job: Job::Fiber(fiber),
                thread: Some(thread),
            },
            true,
        )
    }

    /// Enqueue a batch of fibers under a single queue lock.
    pub fn schedule_fibers<I>(&self, fibers: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<Fiber>>,
    {
        if self.core.stop_requested.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let need_tickle = {
            let mut queue = self
                .core
                .queue
                .lock()
                .expect("scheduler queue lock poisoned");
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(fibers.into_iter().map(|f| Task {
                job: Job::Fiber(f),
                thread: None,
            }));
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.core.tickle();
        }
        Ok(())
    }

    fn check_thread(&self, thread: usize) -> Result<()> {
        if thread >= self.core.thread_count {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "thread hint {} out of range ({} threads)",
                    thread, self.core.thread_count
                ),
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.core.name)
            .field("threads", &self.core.thread_count)
            .finish_non_exhaustive()
    }
}

/// The scheduler whose dispatch loop owns the calling thread, if any.
pub fn current() -> Option<Scheduler> {
    CURRENT_SCHED
        .with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
        .map(Scheduler::from_core)
}

/// Dispatch-thread index within the current scheduler, if the calling
/// thread is a worker.
pub fn current_worker_id() -> Option<usize> {
    WORKER_ID.with(|w| w.get())
}

pub(crate) fn current_core() -> Option<Arc<SchedulerCore>> {
    CURRENT_SCHED.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

////////////////////////////////////////////////////////////////////////////////
// Dispatch loop
////////////////////////////////////////////////////////////////////////////////

fn run(core: Arc<SchedulerCore>, worker_id: usize) {
    CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(Arc::downgrade(&core)));
    WORKER_ID.with(|w| w.set(Some(worker_id)));

    let hooks = core.hooks();
    if let Some(hooks) = &hooks {
        hooks.on_thread_start();
    }

    let idle_fiber = {
        let core = core.clone();
        let hooks = hooks.clone();
        Builder::new()
            .name(format!("{}/idle/{}", core.name, worker_id))
            .spawn(move || match &hooks {
                Some(hooks) => hooks.idle(),
                None => core.bare_idle(),
            })
            .expect("failed to allocate the idle fiber")
    };

    // One cached fiber per worker carries raw callables; recycled through
    // reset() after each terminal run.
    let mut cached: Option<Arc<Fiber>> = None;

    log::trace!("worker {}/{} dispatching", core.name, worker_id);
    loop {
        let mut tickle_me = false;
        let mut task = None;
        {
            let mut queue = core.queue.lock().expect("scheduler queue lock poisoned");
            let mut i = 0;
            while i < queue.len() {
                match queue[i].thread {
                    Some(t) if t != worker_id => {
                        // Affined elsewhere: ping another worker once we
                        // release the lock.
                        tickle_me = true;
                        i += 1;
                    }
                    _ => {
                        task = queue.remove(i);
                        break;
                    }
                }
            }
            if task.is_some() {
                core.active_count.fetch_add(1, Ordering::AcqRel);
            }
        }
        if tickle_me {
            core.tickle();
        }

        if let Some(task) = task {
            match task.job {
                Job::Fiber(f) => {
                    // A continuation may fire between event registration and
                    // the completion of the registrant's yield; the HOLD
                    // transition is then imminent.
                    while f.state() == State::Exec {
                        std::hint::spin_loop();
                    }
                    match f.state() {
                        State::Init | State::Ready | State::Hold => {
                            if f.clone().resume() == State::Ready {
                                core.push_fiber(f);
                            }
                        }
                        state => {
                            log::warn!(
                                "worker {}/{} discarding fiber {} in state {:?}",
                                core.name,
                                worker_id,
                                f.id(),
                                state
                            );
                        }
                    }
                }
                Job::Call(cb) => {
                    let f = match cached.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb).expect("failed to allocate a worker fiber"),
                    };
                    match f.clone().resume() {
                        // Recycle the stack for the next callable.
                        State::Term | State::Except => cached = Some(f),
                        State::Ready => core.push_fiber(f),
                        // HOLD: some registration owns the fiber now.
                        _ => {}
                    }
                }
            }
            core.active_count.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        // Nothing runnable: hand the thread to the idle fiber.
        if matches!(idle_fiber.state(), State::Term | State::Except) {
            break;
        }
        core.idle_count.fetch_add(1, Ordering::AcqRel);
        let idle_state = idle_fiber.clone().resume();
        core.idle_count.fetch_sub(1, Ordering::AcqRel);
        if matches!(idle_state, State::Term | State::Except) {
            break;
        }
    }

    // Wake peers so they re-check the stopping predicate.
    core.tickle();
    log::trace!("worker {}/{} exiting", core.name, worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_scheduled_callables() {
        let sched = Scheduler::new(2, false, "test_run");
        let hits = Arc::new(AtomicUsize::new(0));
        sched.start();
        for _ in 0..16 {
            let hits = hits.clone();
            sched
                .schedule(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn work_scheduled_before_start_runs() {
        let sched = Scheduler::new(1, false, "test_prestart");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        sched
            .schedule(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        sched.start();
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_after_stop_is_rejected() {
        let sched = Scheduler::new(1, false, "test_stopped");
        sched.start();
        sched.stop();
        let err = sched.schedule(|| {}).unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[test]
    fn thread_affinity_is_honored() {
        let sched = Scheduler::new(2, false, "test_affinity");
        sched.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let seen = seen.clone();
            sched
                .schedule_to(1, move || {
                    seen.lock().unwrap().push(current_worker_id());
                })
                .unwrap();
        }
        sched.stop();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|id| *id == Some(1)));
    }

    #[test]
    fn affinity_hint_out_of_range_is_rejected() {
        let sched = Scheduler::new(1, false, "test_hint_range");
        assert!(sched.schedule_to(1, || {}).is_err());
        sched.start();
        sched.stop();
    }

    #[test]
    fn scheduled_fibers_run_and_requeue_on_ready_yield() {
        let sched = Scheduler::new(2, false, "test_fibers");
        sched.start();

        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let f = Fiber::new(move || {
            steps2.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
            steps2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sched.schedule_fiber(f.clone()).unwrap();
        sched.stop();

        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(f.state(), State::Term);
    }

    #[test]
    fn batch_schedule_runs_everything() {
        let sched = Scheduler::new(2, false, "test_batch");
        sched.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let fibers: Vec<_> = (0..8)
            .map(|_| {
                let hits = hits.clone();
                Fiber::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        sched.schedule_fibers(fibers).unwrap();
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "test_caller");
        sched.start();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = hits.clone();
            sched
                .schedule(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        // No spawned worker exists; the drain happens here.
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn current_is_visible_inside_workers() {
        let sched = Scheduler::new(1, false, "test_current");
        sched.start();
        let observed = Arc::new(Mutex::new(None));
        let observed2 = observed.clone();
        sched
            .schedule(move || {
                *observed2.lock().unwrap() =
                    current().map(|s| s.name().to_string());
            })
            .unwrap();
        sched.stop();
        assert_eq!(observed.lock().unwrap().as_deref(), Some("test_current"));
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let sched = Scheduler::new(1, false, "test_panic");
        sched.start();
        sched.schedule(|| panic!("task failure")).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        sched
            .schedule(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
