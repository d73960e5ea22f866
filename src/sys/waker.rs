use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::syscall;

/// Eventfd-backed cross-thread wakeup for a blocked `epoll_wait`.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        match syscall!(write(
            self.fd,
            &buf as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            // The counter is saturated; the wakeup is already pending.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Clear the counter so the next `wake` triggers a fresh event.
    pub fn reset(&self) {
        let mut buf: u64 = 0;
        let _ = syscall!(read(
            self.fd,
            &mut buf as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        ));
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        super::close(self.fd);
    }
}
