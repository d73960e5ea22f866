use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use super::syscall;

/// A signalfd delivering blocked signals as ordinary readiness events.
///
/// Signals routed here must stay blocked for the life of the process, else
/// default dispositions race the fd.
#[derive(Debug)]
pub(crate) struct SignalFd {
    fd: RawFd,
    mask: libc::sigset_t,
}

impl SignalFd {
    pub fn new() -> io::Result<SignalFd> {
        let mask = unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            mask
        };

        let fd = syscall!(signalfd(-1, &mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK))?;
        Ok(SignalFd { fd, mask })
    }

    /// Add `signo` to the watched set, blocking its normal delivery.
    pub fn add(&mut self, signo: libc::c_int) -> io::Result<()> {
        unsafe {
            libc::sigaddset(&mut self.mask, signo);
            if libc::pthread_sigmask(libc::SIG_BLOCK, &self.mask, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        syscall!(signalfd(
            self.fd,
            &self.mask,
            libc::SFD_CLOEXEC | libc::SFD_NONBLOCK
        ))?;
        Ok(())
    }

    /// Drain pending signals, returning their numbers.
    pub fn read(&self) -> Vec<libc::c_int> {
        let mut signals = Vec::new();
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let res = syscall!(read(
                self.fd,
                &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                mem::size_of::<libc::signalfd_siginfo>(),
            ));
            match res {
                Ok(n) if n as usize == mem::size_of::<libc::signalfd_siginfo>() => {
                    signals.push(info.ssi_signo as libc::c_int)
                }
                _ => break,
            }
        }
        signals
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        super::close(self.fd);
    }
}
