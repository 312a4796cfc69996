//! Timer behavior through a live event loop: expiry order, recurring
//! cadence, front-insertion wakeups and cooperative sleep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::fiber;
use filament::io::IoManager;

fn wait_until<F: Fn() -> bool>(deadline: Duration, cond: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn timers_fire_in_deadline_order() {
    let io = IoManager::new(1, false, "timer_order").unwrap();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();

    for (delay, tag) in [(30u64, "A"), (10, "B"), (20, "C")] {
        let log = log.clone();
        io.add_timer(Duration::from_millis(delay), move || {
            log.lock().unwrap().push(tag);
        });
    }

    assert!(wait_until(Duration::from_secs(2), || log.lock().unwrap().len() == 3));
    assert_eq!(*log.lock().unwrap(), vec!["B", "C", "A"]);
    // All three deadlines lie within 30 ms; anything near the idle-timeout
    // scale would mean the wakeup path is broken.
    assert!(start.elapsed() < Duration::from_secs(1));

    io.stop();
}

#[test]
fn recurring_timer_fires_until_cancelled() {
    let io = IoManager::new(1, false, "timer_recurring").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let hits2 = hits.clone();
    let timer = io.add_recurring_timer(Duration::from_millis(10), move || {
        hits2.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) >= 3
    }));
    assert!(timer.cancel());

    io.stop();
}

#[test]
fn front_insertion_shortens_a_long_wait() {
    let io = IoManager::new(1, false, "timer_front").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    // Let the worker settle into a full-length epoll_wait first.
    std::thread::sleep(Duration::from_millis(50));

    let fired2 = fired.clone();
    let start = Instant::now();
    io.add_timer(Duration::from_millis(20), move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });

    assert!(wait_until(Duration::from_secs(2), || {
        fired.load(Ordering::SeqCst) == 1
    }));
    // Without the front-insertion tickle this would sit out the full
    // five-second idle timeout.
    assert!(start.elapsed() < Duration::from_secs(1));

    io.stop();
}

#[test]
fn fiber_sleep_releases_the_worker() {
    let io = IoManager::new(1, false, "timer_sleep").unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let order2 = order.clone();
    io.schedule(move || {
        fiber::sleep(Duration::from_millis(60));
        order2.lock().unwrap().push("sleeper");
    })
    .unwrap();

    let order3 = order.clone();
    io.schedule(move || {
        order3.lock().unwrap().push("runner");
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || order.lock().unwrap().len() == 2));
    // One worker thread: the sleeper parked and let the runner through.
    assert_eq!(*order.lock().unwrap(), vec!["runner", "sleeper"]);

    io.stop();
}
