//! Thin wrappers over the Unix syscalls the crate drives directly.

pub(crate) mod epoll;
mod signal;
mod waker;

pub(crate) use epoll::{Events, Selector};
pub(crate) use signal::SignalFd;
pub(crate) use waker::Waker;

use std::io;
use std::os::unix::io::RawFd;

/// Invoke a libc function and convert a -1 return into the last OS error.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

pub(crate) fn close(fd: RawFd) {
    // Nothing useful can be done with a close error here.
    let _ = syscall!(close(fd));
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}
