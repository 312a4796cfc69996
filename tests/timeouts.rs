//! Timeout and cancellation semantics of parked operations.

use std::io::ErrorKind;
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use filament::fd::fd_manager;
use filament::io::{Direction, IoManager};
use filament::stream;

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
fn parked_read_times_out() {
    let io = IoManager::new(2, false, "read_timeout").unwrap();
    let (a, _b_keepalive) = UnixStream::pair().unwrap();
    let fd_a = a.into_raw_fd();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let result = stream::read(fd_a, &mut buf, Some(Duration::from_millis(50)));
        tx.send((result.map(|_| ()), start.elapsed())).unwrap();
    })
    .unwrap();

    let (result, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(elapsed >= Duration::from_millis(45), "woke after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3));

    // The READ slot is empty again and no event registration leaked.
    assert_eq!(io.pending_events(), 0);

    stream::close(fd_a).unwrap();
    io.stop();
}

#[test]
fn per_descriptor_timeout_is_used_when_no_argument_is_given() {
    let io = IoManager::new(2, false, "fd_timeout").unwrap();
    let (a, _b_keepalive) = UnixStream::pair().unwrap();
    let fd_a = a.into_raw_fd();

    let ctx = fd_manager().get(fd_a, true).unwrap();
    ctx.set_timeout(Direction::Read, Some(Duration::from_millis(40)));

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let mut buf = [0u8; 16];
        let result = stream::read(fd_a, &mut buf, None);
        tx.send(result.map(|_| ())).unwrap();
    })
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
    assert_eq!(io.pending_events(), 0);

    stream::close(fd_a).unwrap();
    io.stop();
}

#[test]
fn close_cancels_a_parked_read() {
    let io = IoManager::new(2, false, "cancel_close").unwrap();
    let (a, _b_keepalive) = UnixStream::pair().unwrap();
    let fd_a = a.into_raw_fd();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let mut buf = [0u8; 16];
        let result = stream::read(fd_a, &mut buf, None);
        tx.send(result.map(|_| ()).map_err(|e| e.raw_os_error())).unwrap();
    })
    .unwrap();

    // Let the reader park before pulling the descriptor out from under it.
    assert!(wait_until(Duration::from_secs(2), || io.pending_events() == 1));

    io.schedule(move || {
        stream::close(fd_a).unwrap();
    })
    .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap_err(), Some(libc::ECANCELED));
    assert_eq!(io.pending_events(), 0);

    io.stop();
}

#[test]
fn cancel_event_resumes_the_parked_fiber() {
    let io = IoManager::new(2, false, "cancel_event").unwrap();
    let (a, _b_keepalive) = UnixStream::pair().unwrap();
    let fd_a = a.into_raw_fd();

    let (tx, rx) = mpsc::channel();
    {
        let io = io.clone();
        let tx = tx.clone();
        io.clone()
            .schedule(move || {
                // Park directly on the poller, then get kicked back out.
                io.add_event(fd_a, Direction::Read).unwrap();
                filament::fiber::yield_to_hold();
                tx.send(()).unwrap();
            })
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || io.pending_events() == 1));
    assert!(io.cancel_event(fd_a, Direction::Read));
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(io.pending_events(), 0);

    // Nothing left to cancel.
    assert!(!io.cancel_event(fd_a, Direction::Read));

    stream::close(fd_a).unwrap();
    io.stop();
}

#[test]
fn double_registration_is_rejected() {
    let io = IoManager::new(2, false, "double_reg").unwrap();
    let (a, _b_keepalive) = UnixStream::pair().unwrap();
    let fd_a = a.into_raw_fd();

    let (tx, rx) = mpsc::channel();
    {
        let io2 = io.clone();
        io.schedule(move || {
            io2.add_event_with(fd_a, Direction::Read, || {}).unwrap();
            let second = io2.add_event_with(fd_a, Direction::Read, || {});
            tx.send(second.is_err()).unwrap();
        })
        .unwrap();
    }

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(io.pending_events(), 1);

    // Drop the callback registration without firing it.
    assert!(io.del_event(fd_a, Direction::Read));
    assert_eq!(io.pending_events(), 0);

    stream::close(fd_a).unwrap();
    io.stop();
}
