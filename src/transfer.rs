use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::trace;

use crate::buffer::Buffer;
use crate::error::Error;
use crate::net::tls::{self, SharedTls};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

const RW_MAX: usize = 1 << 20;

/// Completion callback, run exactly once on the event loop thread.
pub type TransferCallback = Box<dyn FnOnce(bool)>;

/// One bounded I/O operation against an fd.
///
/// A transfer is created on the loop thread, moved into the pool, attempted
/// by [`transfer`] until finished or failed, and handed back for completion.
/// Failure is reported solely through the completion callback's `success`
/// flag.
///
/// [`transfer`]: Transfer::transfer
pub struct Transfer {
    id: u64,
    fd: RawFd,
    tls: Option<SharedTls>,
    kind: Kind,
    length: usize,
    timeout: Option<Duration>,
    finished: bool,
    success: bool,
}

enum Kind {
    /// Completes on the first readiness dispatch, moving no bytes.
    Readiness,
    /// Appends until the output buffer holds `target` bytes.
    ReadBytes { buf: Buffer, target: usize },
    /// Appends until `mark` appears in the buffer, or the buffer reaches
    /// `max` bytes. Overflow still completes successfully; the caller
    /// detects it from the buffer length.
    ReadUntil { buf: Buffer, max: usize, mark: Vec<u8> },
    /// Drains the buffer to the fd.
    Write { buf: Buffer },
}

impl Transfer {
    /// A zero-length transfer that fires when the direction is ready.
    pub fn readiness(fd: RawFd, tls: Option<SharedTls>) -> Transfer {
        Transfer::new(fd, tls, Kind::Readiness, 0)
    }

    /// Read until `buf` holds exactly `target` bytes.
    pub fn read_bytes(fd: RawFd, tls: Option<SharedTls>, buf: Buffer, target: usize) -> Transfer {
        let mut t = Transfer::new(fd, tls, Kind::ReadBytes { buf, target }, target);
        t.check_satisfied();
        t
    }

    /// Read until `mark` appears, bounded by `max` bytes.
    pub fn read_until(
        fd: RawFd,
        tls: Option<SharedTls>,
        buf: Buffer,
        max: usize,
        mark: &[u8],
    ) -> Transfer {
        let mut t = Transfer::new(
            fd,
            tls,
            Kind::ReadUntil {
                buf,
                max,
                mark: mark.to_vec(),
            },
            max,
        );
        t.check_satisfied();
        t
    }

    /// Drain `buf` to the fd.
    pub fn write(fd: RawFd, tls: Option<SharedTls>, buf: Buffer) -> Transfer {
        let length = buf.len();
        let mut t = Transfer::new(fd, tls, Kind::Write { buf }, length);
        if length == 0 {
            t.finished = true;
            t.success = true;
        }
        t
    }

    fn new(fd: RawFd, tls: Option<SharedTls>, kind: Kind, length: usize) -> Transfer {
        Transfer {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fd,
            tls,
            kind,
            length,
            timeout: None,
            finished: false,
            success: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub(crate) fn is_read(&self) -> bool {
        matches!(
            self.kind,
            Kind::ReadBytes { .. } | Kind::ReadUntil { .. }
        )
    }

    /// TLS needs the fd readable to make progress on this transfer.
    pub fn wants_read(&self) -> bool {
        self.tls.as_ref().map_or(false, |t| tls::lock(t).wants_read())
    }

    /// TLS needs the fd writable to make progress on this transfer.
    pub fn wants_write(&self) -> bool {
        self.tls.as_ref().map_or(false, |t| tls::lock(t).wants_write())
    }

    /// Can this transfer make progress right now, without waiting for the
    /// fd?
    pub fn is_pending(&self) -> bool {
        match &self.kind {
            Kind::ReadBytes { .. } | Kind::ReadUntil { .. } => {
                self.satisfied()
                    || self
                        .tls
                        .as_ref()
                        .map_or(false, |t| tls::lock(t).has_buffered_plaintext())
            }
            _ => false,
        }
    }

    fn satisfied(&self) -> bool {
        match &self.kind {
            Kind::Readiness => false,
            Kind::ReadBytes { buf, target } => *target <= buf.len(),
            Kind::ReadUntil { buf, max, mark } => {
                buf.index_of(mark).is_some() || (*max != 0 && *max <= buf.len())
            }
            // A drained buffer still needs its last TLS records flushed.
            Kind::Write { buf } => {
                buf.is_empty()
                    && self
                        .tls
                        .as_ref()
                        .map_or(true, |t| !tls::lock(t).wants_write())
            }
        }
    }

    fn check_satisfied(&mut self) {
        if self.satisfied() {
            self.finished = true;
            self.success = true;
        }
    }

    /// Attempt one unit of progress.
    ///
    /// Returns bytes moved (0 when not ready) or -1 on a fatal condition,
    /// in which case `finished` stays false and the owner fails the queue.
    pub fn transfer(&mut self) -> isize {
        if self.finished {
            return 0;
        }

        let ret = match &self.kind {
            Kind::Readiness => {
                self.finished = true;
                self.success = true;
                return 0;
            }
            Kind::ReadBytes { buf, target } => {
                let want = target.saturating_sub(buf.len());
                Self::attempt_read(self.fd, &self.tls, buf, want)
            }
            Kind::ReadUntil { buf, max, .. } => {
                let want = if *max == 0 {
                    RW_MAX
                } else {
                    max.saturating_sub(buf.len()).max(1)
                };
                Self::attempt_read(self.fd, &self.tls, buf, want)
            }
            Kind::Write { buf } => Self::attempt_write(self.fd, &self.tls, buf),
        };

        trace!("transfer fd={} ret={}", self.fd, ret);

        if 0 <= ret && self.satisfied() {
            self.finished = true;
            self.success = true;
        }
        ret
    }

    fn attempt_read(fd: RawFd, tls: &Option<SharedTls>, buf: &Buffer, want: usize) -> isize {
        let want = want.clamp(1, RW_MAX);

        match tls {
            None => match buf.read_from_fd(fd, want) {
                Ok(0) => -1, // end of stream
                Ok(n) => n as isize,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
                Err(_) => -1,
            },
            Some(engine) => {
                let mut engine = tls::lock(engine);
                let mut chunk = vec![0u8; want.min(16 * 1024)];
                match engine.read(&mut chunk) {
                    Ok(0) => 0, // blocked; direction hints are set
                    Ok(n) => {
                        if buf.add(&chunk[..n]).is_err() {
                            return -1;
                        }
                        n as isize
                    }
                    Err(Error::EndOfStream) => -1,
                    Err(_) => -1,
                }
            }
        }
    }

    fn attempt_write(fd: RawFd, tls: &Option<SharedTls>, buf: &Buffer) -> isize {
        match tls {
            None => match buf.write_to_fd(fd, RW_MAX) {
                Ok(n) => n as isize,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
                Err(_) => -1,
            },
            Some(engine) => {
                let mut engine = tls::lock(engine);

                // Coalesce the front of the chain so one record carries it.
                let chunk = buf.pullup(16 * 1024);
                if chunk.is_empty() {
                    // Buffer drained; finish flushing queued records.
                    return match engine.flush() {
                        Ok(_) => 0,
                        Err(_) => -1,
                    };
                }

                match engine.write(&chunk) {
                    Ok(0) => 0,
                    Ok(n) => match buf.drain(n) {
                        Ok(()) => n as isize,
                        Err(_) => -1,
                    },
                    Err(_) => -1,
                }
            }
        }
    }
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            Kind::Readiness => "readiness",
            Kind::ReadBytes { .. } => "read-bytes",
            Kind::ReadUntil { .. } => "read-until",
            Kind::Write { .. } => "write",
        };
        f.debug_struct("Transfer")
            .field("fd", &self.fd)
            .field("kind", &kind)
            .field("length", &self.length)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_until_satisfied_at_creation() {
        let buf = Buffer::from_bytes(b"HTTP/1.1 200 OK\r\n\r\nrest");
        let t = Transfer::read_until(-1, None, buf.clone(), 1024, b"\r\n\r\n");
        assert!(t.is_finished());
        assert!(t.is_success());
        // Trailing bytes stay for the next consumer.
        assert_eq!(buf.len(), 23);
    }

    #[test]
    fn read_until_overflow_is_success() {
        let buf = Buffer::from_bytes(b"0123456789");
        let t = Transfer::read_until(-1, None, buf, 10, b"\r\n\r\n");
        assert!(t.is_finished());
        assert!(t.is_success());
    }

    #[test]
    fn read_bytes_counts_existing_data() {
        let buf = Buffer::from_bytes(b"abcd");
        let t = Transfer::read_bytes(-1, None, buf.clone(), 4);
        assert!(t.is_finished());

        let t = Transfer::read_bytes(-1, None, buf, 5);
        assert!(!t.is_finished());
    }

    #[test]
    fn empty_write_finishes_immediately() {
        let t = Transfer::write(-1, None, Buffer::new());
        assert!(t.is_finished());
        assert!(t.is_success());
    }

    #[test]
    fn write_moves_bytes_through_a_pipe() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let buf = Buffer::from_bytes(b"hello pipe");
        let mut t = Transfer::write(wr, None, buf);
        let n = t.transfer();
        assert_eq!(n, 10);
        assert!(t.is_finished());
        assert!(t.is_success());

        let mut out = [0u8; 16];
        let n = unsafe { libc::read(rd, out.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(&out[..n as usize], b"hello pipe");

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn read_hits_end_of_stream() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);
        unsafe { libc::close(wr) };

        let mut t = Transfer::read_bytes(rd, None, Buffer::new(), 4);
        assert_eq!(t.transfer(), -1);
        assert!(!t.is_finished());

        unsafe { libc::close(rd) };
    }
}
