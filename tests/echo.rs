//! End-to-end echo over a socket pair: two fibers, two worker threads,
//! cooperative reads and writes, and a clean teardown with no leaked
//! fibers or event registrations.

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::Duration;

use filament::io::IoManager;
use filament::{fiber, stream};

#[test]
fn echo_round_trip_over_a_socket_pair() {
    let baseline = fiber::total_fibers();

    let io = IoManager::new(2, false, "echo").unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let fd_a = a.into_raw_fd();
    let fd_b = b.into_raw_fd();

    let (result_tx, result_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    // F: writes "hello" into its end, then reads the echo back.
    io.schedule(move || {
        let n = stream::write(fd_a, b"hello", None).unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            let n = stream::read(fd_a, &mut buf[got..], Some(Duration::from_secs(5))).unwrap();
            assert!(n > 0, "unexpected eof");
            got += n;
        }
        result_tx.send(buf.to_vec()).unwrap();
    })
    .unwrap();

    // G: reads five bytes from the other end and writes them back.
    io.schedule(move || {
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            let n = stream::read(fd_b, &mut buf[got..], Some(Duration::from_secs(5))).unwrap();
            assert!(n > 0, "unexpected eof");
            got += n;
        }
        let mut written = 0;
        while written < buf.len() {
            written += stream::write(fd_b, &buf[written..], None).unwrap();
        }
        done_tx.send(()).unwrap();
    })
    .unwrap();

    let echoed = result_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(echoed, b"hello");
    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // Both fibers completed: nothing may be left parked on the poller.
    assert_eq!(io.pending_events(), 0);

    stream::close(fd_a).unwrap();
    stream::close(fd_b).unwrap();

    io.stop();
    assert_eq!(fiber::total_fibers(), baseline);
}
