#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use evio::{EventFlags, EventLoop};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("failed to init logger");
    });
}

/// Drive the loop until `done` returns true, panicking after `timeout`.
///
/// A persistent short timer keeps `run_once` from blocking indefinitely
/// while the condition is still false.
pub fn run_until<F>(base: &EventLoop, timeout: Duration, done: F)
where
    F: Fn() -> bool,
{
    let tick = base.new_event(|| {}, EventFlags::PERSIST);
    tick.add_timeout(Duration::from_millis(5));

    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < timeout, "test timed out");
        base.run_once().expect("event loop failed");
    }

    tick.del();
}

/// A connected non-blocking Unix stream pair.
pub fn socketpair() -> (i32, i32) {
    let mut fds = [0 as libc::c_int; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(res, 0, "socketpair failed");
    (fds[0], fds[1])
}
