use std::mem;
use std::os::unix::io::RawFd;

use log::trace;

use crate::error::{Error, Result};
use crate::net::SockAddr;
use crate::sys::{self, syscall};

/// Socket creation flags.
pub mod flags {
    pub const NONBLOCKING: u32 = 1 << 0;
    pub const CLOEXEC: u32 = 1 << 1;
    pub const REUSEADDR: u32 = 1 << 2;
    pub const KEEPALIVE: u32 = 1 << 3;
    pub const IPV6: u32 = 1 << 4;
    pub const UDP: u32 = 1 << 5;
}

/// I/O flags for [`Socket::read`] and [`Socket::write`].
pub mod io_flags {
    pub const NONBLOCKING: u32 = 1 << 0;
    pub const PEEK: u32 = 1 << 1;
}

/// A low-level socket owning its descriptor.
///
/// Reads signal end-of-stream with a distinguished [`Error::EndOfStream`];
/// a non-blocking operation that cannot proceed returns `Ok(0)`.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Create a socket and optionally bind it.
    pub fn open(socket_flags: u32, bind_addr: Option<&SockAddr>) -> Result<Socket> {
        crate::init();

        let domain = if socket_flags & flags::IPV6 != 0
            || bind_addr.map_or(false, |a| a.is_ipv6())
        {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };

        let mut ty = if socket_flags & flags::UDP != 0 {
            libc::SOCK_DGRAM
        } else {
            libc::SOCK_STREAM
        };
        if socket_flags & flags::NONBLOCKING != 0 {
            ty |= libc::SOCK_NONBLOCK;
        }
        if socket_flags & flags::CLOEXEC != 0 {
            ty |= libc::SOCK_CLOEXEC;
        }

        let fd = syscall!(socket(domain, ty, 0))?;
        let socket = Socket { fd };

        if socket_flags & flags::REUSEADDR != 0 {
            socket.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        }
        if socket_flags & flags::KEEPALIVE != 0 {
            socket.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
        }

        if let Some(addr) = bind_addr {
            socket.bind(addr)?;
        }

        trace!("socket fd={} opened", fd);
        Ok(socket)
    }

    /// Adopt an already-open descriptor.
    pub fn from_raw(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Release ownership of the descriptor without closing it.
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }

    fn set_opt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
        Ok(())
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        if blocking {
            let flags = syscall!(fcntl(self.fd, libc::F_GETFL))?;
            syscall!(fcntl(self.fd, libc::F_SETFL, flags & !libc::O_NONBLOCK))?;
            Ok(())
        } else {
            sys::set_nonblocking(self.fd)?;
            Ok(())
        }
    }

    pub fn bind(&self, addr: &SockAddr) -> Result<()> {
        let (storage, len) = addr.to_raw()?;
        syscall!(bind(
            self.fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        ))
        .map_err(|e| Error::Connect(format!("could not bind to {}: {}", addr, e)))?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        syscall!(listen(self.fd, backlog))?;
        Ok(())
    }

    /// The locally bound address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SockAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ))?;
        Ok(SockAddr::from_raw(&storage))
    }

    /// Accept one connection; `Ok(None)` when none is pending.
    pub fn accept(&self) -> Result<Option<(Socket, SockAddr)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        match syscall!(accept4(
            self.fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )) {
            Ok(fd) => Ok(Some((Socket { fd }, SockAddr::from_raw(&storage)))),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start a connect; in-progress on a non-blocking socket is success.
    pub fn connect(&self, addr: &SockAddr) -> Result<()> {
        let (storage, len) = addr.to_raw()?;

        match syscall!(connect(
            self.fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )) {
            Ok(_) => Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(Error::Connect(format!("connect to {} failed: {}", addr, e))),
        }
    }

    /// The pending error from an asynchronous connect, if any.
    pub fn take_error(&self) -> Result<Option<i32>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(if err == 0 { None } else { Some(err) })
    }

    /// Read into `buf`. `Ok(0)` when a non-blocking read would block;
    /// `Err(EndOfStream)` on orderly close.
    pub fn read(&self, buf: &mut [u8], io: u32) -> Result<usize> {
        let mut flags = 0;
        if io & io_flags::NONBLOCKING != 0 {
            flags |= libc::MSG_DONTWAIT;
        }
        if io & io_flags::PEEK != 0 {
            flags |= libc::MSG_PEEK;
        }

        match syscall!(recv(
            self.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
        )) {
            Ok(0) if !buf.is_empty() => Err(Error::EndOfStream),
            Ok(n) => Ok(n as usize),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write from `buf`, returning bytes sent; `Ok(0)` when a non-blocking
    /// write would block.
    pub fn write(&self, buf: &[u8], io: u32) -> Result<usize> {
        let mut flags = libc::MSG_NOSIGNAL;
        if io & io_flags::NONBLOCKING != 0 {
            flags |= libc::MSG_DONTWAIT;
        }

        match syscall!(send(
            self.fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
        )) {
            Ok(n) => Ok(n as usize),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn shutdown(&self) {
        let _ = syscall!(shutdown(self.fd, libc::SHUT_RDWR));
    }
}

/// `SO_ERROR` for a descriptor not owned by a `Socket`.
pub(crate) fn take_error_fd(fd: RawFd) -> Result<Option<i32>> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ))?;
    Ok(if err == 0 { None } else { Some(err) })
}

impl Drop for Socket {
    fn drop(&mut self) {
        trace!("socket fd={} closed", self.fd);
        sys::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_connect() {
        let server = Socket::open(
            flags::NONBLOCKING | flags::CLOEXEC | flags::REUSEADDR,
            Some(&"127.0.0.1:0".parse().unwrap()),
        )
        .unwrap();
        server.listen(16).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        assert!(server.accept().unwrap().is_none());

        let client = Socket::open(flags::NONBLOCKING | flags::CLOEXEC, None).unwrap();
        client.connect(&addr).unwrap();

        // Loopback accepts promptly, but allow the kernel a few retries.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = server.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (peer, peer_addr) = accepted.expect("no connection accepted");
        assert!(peer_addr.is_ipv4());
        assert!(peer.raw() >= 0);
    }

    #[test]
    fn read_signals_end_of_stream() {
        let server = Socket::open(
            flags::NONBLOCKING | flags::REUSEADDR,
            Some(&"127.0.0.1:0".parse().unwrap()),
        )
        .unwrap();
        server.listen(4).unwrap();
        let addr = server.local_addr().unwrap();

        let client = Socket::open(flags::NONBLOCKING, None).unwrap();
        client.connect(&addr).unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = server.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (peer, _) = accepted.unwrap();

        drop(client);

        let mut buf = [0u8; 8];
        let mut saw_eof = false;
        for _ in 0..100 {
            match peer.read(&mut buf, io_flags::NONBLOCKING) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(Error::EndOfStream) => {
                    saw_eof = true;
                    break;
                }
                other => panic!("unexpected read result: {:?}", other.err()),
            }
        }
        assert!(saw_eof);
    }
}
