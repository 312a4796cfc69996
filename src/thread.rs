//! Named OS threads with a startup handshake.
//!
//! [`Thread::spawn`] returns only after the new thread has installed its
//! thread-local identity. This guarantees that work scheduled against the
//! new thread's id right after the constructor returns observes a valid
//! identity on the target.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::Result;
use crate::sync::Semaphore;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// Name of the calling OS thread as registered by [`Thread::spawn`], or
/// `"UNKNOWN"` for foreign threads.
pub fn current_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

pub(crate) fn set_current_name(name: &str) {
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// A named OS thread.
///
/// The constructor performs a semaphore handshake with the child: it does
/// not return until the child runs and has published its identity.
#[derive(Debug)]
pub struct Thread {
    name: String,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Thread {
    pub fn spawn<F>(name: &str, f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let ready = Arc::new(Semaphore::new(0));
        let child_ready = ready.clone();
        let child_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                set_current_name(&child_name);
                child_ready.notify();
                f();
            })
            .map_err(crate::error::Error::Io)?;

        ready.wait();
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. A panic on the child thread is
    /// propagated to the joiner.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Detach when the handle is dropped without a join.
        drop(self.handle.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn name_is_installed_before_spawn_returns() {
        let observed = Arc::new(std::sync::Mutex::new(String::new()));
        let observed2 = observed.clone();
        let t = Thread::spawn("worker_0", move || {
            *observed2.lock().unwrap() = current_name();
        })
        .unwrap();
        t.join();
        assert_eq!(observed.lock().unwrap().as_str(), "worker_0");
    }

    #[test]
    fn foreign_thread_name_is_unknown() {
        assert_eq!(current_name(), "UNKNOWN");
    }

    #[test]
    fn join_runs_to_completion() {
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let t = Thread::spawn("joiner", move || {
            done2.store(true, Ordering::Release);
        })
        .unwrap();
        t.join();
        assert!(done.load(Ordering::Acquire));
    }
}
