//! One-shot and periodic timers over a monotonic clock.
//!
//! A [`TimerManager`] keeps an ordered set of deadlines keyed by
//! `(absolute deadline ms, insertion sequence)`, so equal deadlines fire in
//! insertion order and the set is totally ordered. All mutations happen
//! under the manager's write lock.
//!
//! The manager never sleeps by itself: the event loop asks for
//! [`next_expiry_ms`](TimerManager::next_expiry_ms) to bound its wait and
//! calls [`drain_expired`](TimerManager::drain_expired) afterwards. When a
//! new timer lands at the front of the set, a hook wakes the loop so it can
//! shorten its sleep.
//!
//! Deadlines come from a monotonic source, never the wall clock. As a
//! safety valve against a misbehaving clock, a backwards jump of an hour or
//! more makes the next drain treat every timer as expired once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::clock::Clock;

/// Threshold for the monotonic-clock rollback valve.
const ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Sentinel returned by [`TimerManager::next_expiry_ms`] when no timer is
/// pending.
pub const NO_EXPIRY: u64 = u64::MAX;

/// Shared, repeatedly-invocable timer callback.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

////////////////////////////////////////////////////////////////////////////////
// TimerManager
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
pub struct TimerManager {
    core: Arc<TimerCore>,
}

struct TimerCore {
    set: RwLock<TimerSet>,
    /// Suppresses repeated front-insertion wakeups between two expiry
    /// queries.
    tickled: AtomicBool,
    clock: Clock,
    front_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<TimerShared>>,
    next_seq: u64,
    prev_now_ms: u64,
}

struct TimerShared {
    core: Weak<TimerCore>,
    data: Mutex<TimerData>,
}

struct TimerData {
    deadline_ms: u64,
    seq: u64,
    interval_ms: u64,
    recurring: bool,
    /// Cleared on expiry (non-recurring) and on cancellation.
    cb: Option<TimerCallback>,
}

impl TimerManager {
    #[inline]
    pub fn new() -> Self {
        Self::with_clock(Clock::default())
    }

    /// A manager reading time from a custom [`Clock`]; the way to exercise
    /// expiry and rollback without sleeping.
    pub fn with_clock(clock: Clock) -> Self {
        let prev_now_ms = clock.now_ms();
        Self {
            core: Arc::new(TimerCore {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    next_seq: 0,
                    prev_now_ms,
                }),
                tickled: AtomicBool::new(false),
                clock,
                front_hook: Mutex::new(None),
            }),
        }
    }

    /// Install the front-insertion hook. The I/O manager points this at its
    /// tickle pipe so an `epoll_wait` bounded by a stale expiry is cut
    /// short.
    pub(crate) fn set_front_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self
            .core
            .front_hook
            .lock()
            .expect("front hook lock poisoned") = Some(hook);
    }

    /// Insert a timer expiring `delay` from now. A recurring timer
    /// re-inserts itself with `deadline = now + delay` on every expiry.
    pub fn add_timer<F>(&self, delay: Duration, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_shared(delay, Arc::new(cb), recurring)
    }

    /// As [`add_timer`](Self::add_timer), but the callback first checks
    /// whether `cond` is still alive; if every strong reference is gone the
    /// expiry is a no-op.
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
        let cond = Arc::downgrade(cond);
        self.add_timer_shared(
            delay,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            }),
            recurring,
        )
    }

    fn add_timer_shared(&self, delay: Duration, cb: TimerCallback, recurring: bool) -> Timer {
        let interval_ms = delay.as_millis() as u64;
        let now = self.core.clock.now_ms();
        let deadline_ms = now.saturating_add(interval_ms);

        let shared = Arc::new(TimerShared {
            core: Arc::downgrade(&self.core),
            data: Mutex::new(TimerData {
                deadline_ms,
                seq: 0,
                interval_ms,
                recurring,
                cb: Some(cb),
            }),
        });

        let at_front = {
            let mut set = self.core.set.write().expect("timer set lock poisoned");
            let seq = set.next_seq;
            set.next_seq += 1;
            shared.data.lock().expect("timer lock poisoned").seq = seq;
            set.timers.insert((deadline_ms, seq), shared.clone());
            let is_first = set.timers.keys().next() == Some(&(deadline_ms, seq));
            is_first && !self.core.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            self.core.run_front_hook();
        }

        Timer { shared }
    }

    /// Milliseconds until the earliest deadline: 0 when a timer is already
    /// overdue, [`NO_EXPIRY`] when the set is empty.
    pub fn next_expiry_ms(&self) -> u64 {
        self.core.tickled.store(false, Ordering::Release);
        let set = self.core.set.read().expect("timer set lock poisoned");
        match set.timers.keys().next() {
            None => NO_EXPIRY,
            Some(&(deadline_ms, _)) => {
                let now = self.core.clock.now_ms();
                deadline_ms.saturating_sub(now)
            }
        }
    }

    /// Pop every timer whose deadline is due, appending the callbacks in
    /// deadline order. Recurring timers are re-inserted with
    /// `deadline = now + interval`. A clock rollback of an hour or more
    /// expires the whole set once.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.core.clock.now_ms();
        let mut set = self.core.set.write().expect("timer set lock poisoned");
        if set.timers.is_empty() {
            return;
        }

        let rollover = {
            let prev = set.prev_now_ms;
            set.prev_now_ms = now;
            now < prev && now < prev.saturating_sub(ROLLBACK_THRESHOLD_MS)
        };
        if rollover {
            log::warn!(
                "monotonic clock went backwards past {} ms; expiring all {} timers",
                ROLLBACK_THRESHOLD_MS,
                set.timers.len()
            );
        }

        let expired = if rollover {
            std::mem::take(&mut set.timers)
        } else {
            match set.timers.keys().next() {
                Some(&(first, _)) if first <= now => {
                    let rest = set.timers.split_off(&(now.saturating_add(1), 0));
                    std::mem::replace(&mut set.timers, rest)
                }
                _ => return,
            }
        };

        out.reserve(expired.len());
        for shared in expired.into_values() {
            let mut data = shared.data.lock().expect("timer lock poisoned");
            let cb = match &data.cb {
                Some(cb) => cb.clone(),
                // Emptied slot: nothing to fire.
                None => continue,
            };
            out.push(cb);
            if data.recurring {
                let seq = set.next_seq;
                set.next_seq += 1;
                data.deadline_ms = now.saturating_add(data.interval_ms);
                data.seq = seq;
                let key = (data.deadline_ms, seq);
                drop(data);
                set.timers.insert(key, shared);
            } else {
                data.cb = None;
            }
        }
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self
            .core
            .set
            .read()
            .expect("timer set lock poisoned")
            .timers
            .is_empty()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TimerManager").finish_non_exhaustive()
    }
}

impl TimerCore {
    fn run_front_hook(&self) {
        let hook = self.front_hook.lock().expect("front hook lock poisoned");
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Timer
////////////////////////////////////////////////////////////////////////////////

/// A handle to a pending timer, shared between the caller (for
/// cancellation) and the manager. Dropping the handle does not cancel the
/// timer.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Remove a pending timer. Returns `false` if it already fired
    /// (non-recurring), was cancelled before, or the manager is gone. A
    /// cancelled recurring timer does not re-insert.
    pub fn cancel(&self) -> bool {
        let core = match self.shared.core.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut set = core.set.write().expect("timer set lock poisoned");
        let mut data = self.shared.data.lock().expect("timer lock poisoned");
        if data.cb.is_none() {
            return false;
        }
        data.cb = None;
        set.timers.remove(&(data.deadline_ms, data.seq));
        true
    }

    /// Re-base the deadline to `now + interval`, keeping the interval.
    pub fn refresh(&self) -> bool {
        let core = match self.shared.core.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut set = core.set.write().expect("timer set lock poisoned");
        let mut data = self.shared.data.lock().expect("timer lock poisoned");
        if data.cb.is_none() {
            return false;
        }
        if set.timers.remove(&(data.deadline_ms, data.seq)).is_none() {
            return false;
        }
        let seq = set.next_seq;
        set.next_seq += 1;
        data.deadline_ms = core.clock.now_ms().saturating_add(data.interval_ms);
        data.seq = seq;
        set.timers.insert((data.deadline_ms, seq), self.shared.clone());
        true
    }

    /// Change the interval. With `from_now` the deadline re-bases to
    /// `now + interval`, otherwise it keeps the original base point.
    pub fn reset(&self, interval: Duration, from_now: bool) -> bool {
        let interval_ms = interval.as_millis() as u64;
        let core = match self.shared.core.upgrade() {
            Some(core) => core,
            None => return false,
        };

        let at_front = {
            let mut set = core.set.write().expect("timer set lock poisoned");
            let mut data = self.shared.data.lock().expect("timer lock poisoned");
            if data.interval_ms == interval_ms && !from_now {
                return true;
            }
            if data.cb.is_none() {
                return false;
            }
            if set.timers.remove(&(data.deadline_ms, data.seq)).is_none() {
                return false;
            }
            let start = if from_now {
                core.clock.now_ms()
            } else {
                data.deadline_ms.saturating_sub(data.interval_ms)
            };
            let seq = set.next_seq;
            set.next_seq += 1;
            data.interval_ms = interval_ms;
            data.deadline_ms = start.saturating_add(interval_ms);
            data.seq = seq;
            let key = (data.deadline_ms, seq);
            set.timers.insert(key, self.shared.clone());
            let is_first = set.timers.keys().next() == Some(&key);
            is_first && !core.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            core.run_front_hook();
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let data = self.shared.data.lock().expect("timer lock poisoned");
        f.debug_struct("Timer")
            .field("deadline_ms", &data.deadline_ms)
            .field("interval_ms", &data.interval_ms)
            .field("recurring", &data.recurring)
            .field("pending", &data.cb.is_some())
            .finish()
    }
}
