use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::syscall;

/// Readiness interest bits, kept in epoll's own terms.
pub(crate) const READABLE: u32 = libc::EPOLLIN as u32;
pub(crate) const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub(crate) const EDGE: u32 = libc::EPOLLET as u32;

/// The epoll instance behind both the event loop and the pool worker.
#[derive(Debug)]
pub(crate) struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { epfd })
    }

    /// Wait for events, retrying transparently on EINTR.
    ///
    /// A `timeout` of `None` blocks until an event arrives.
    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| to.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        events.inner.clear();
        loop {
            match syscall!(epoll_wait(
                self.epfd,
                events.inner.as_mut_ptr(),
                events.inner.capacity() as i32,
                timeout_ms,
            )) {
                Ok(cnt) => {
                    // epoll_wait never writes more than the given capacity.
                    unsafe { events.inner.set_len(cnt as usize) };
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn register(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interests,
            u64: token,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev))?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interests,
            u64: token,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev))?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // Pre-2.6.9 kernels required a non-null event for DEL.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev))?;
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        super::close(self.epfd);
    }
}

pub(crate) struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            inner: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn token(&self, i: usize) -> u64 {
        self.inner[i].u64
    }

    /// Fired readiness, collapsed to read/write bits.
    ///
    /// Errors and hangups wake both directions so the owner discovers the
    /// condition from the failing syscall.
    pub fn readiness(&self, i: usize) -> (bool, bool) {
        let ev = self.inner[i].events as libc::c_int;

        if ev & (libc::EPOLLERR | libc::EPOLLHUP) != 0 {
            return (true, true);
        }

        let read = ev & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLPRI) != 0;
        let write = ev & libc::EPOLLOUT != 0;
        (read, write)
    }
}
