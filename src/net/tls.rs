use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::trace;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::error::{Error, Result};
use crate::sys::syscall;

/// Shared handle to a TLS engine; transfers hold a clone of this.
pub type SharedTls = Arc<Mutex<TlsEngine>>;

pub(crate) fn lock(tls: &SharedTls) -> std::sync::MutexGuard<'_, TlsEngine> {
    tls.lock().unwrap_or_else(|e| e.into_inner())
}

/// A TLS session interleaved with a non-blocking socket.
///
/// TLS and socket readiness may disagree about direction: a `read` may stall
/// needing the socket writable, and vice versa. After any call that returns
/// `Ok(0)`, [`wants_read`] and [`wants_write`] say which readiness the engine
/// is actually waiting for; the pool inverts its epoll interest accordingly.
///
/// [`wants_read`]: TlsEngine::wants_read
/// [`wants_write`]: TlsEngine::wants_write
pub struct TlsEngine {
    conn: Connection,
    io: FdIo,
    want_read: bool,
    want_write: bool,
    buffered_plaintext: usize,
}

impl TlsEngine {
    pub fn client(config: Arc<ClientConfig>, server_name: &str, fd: RawFd) -> Result<TlsEngine> {
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| Error::Connect(format!("invalid TLS server name '{}'", server_name)))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(TlsEngine::new(Connection::Client(conn), fd))
    }

    pub fn server(config: Arc<ServerConfig>, fd: RawFd) -> Result<TlsEngine> {
        let conn = ServerConnection::new(config)?;
        Ok(TlsEngine::new(Connection::Server(conn), fd))
    }

    fn new(conn: Connection, fd: RawFd) -> TlsEngine {
        TlsEngine {
            conn,
            io: FdIo(fd),
            want_read: false,
            want_write: false,
            buffered_plaintext: 0,
        }
    }

    pub fn wants_read(&self) -> bool {
        self.want_read
    }

    pub fn wants_write(&self) -> bool {
        self.want_write
    }

    /// Decrypted bytes already available without touching the socket.
    pub fn has_buffered_plaintext(&self) -> bool {
        self.buffered_plaintext != 0
    }

    /// Drive the handshake as far as the socket allows.
    ///
    /// Returns `Ok(true)` once complete; `Ok(false)` leaves a direction hint
    /// set.
    pub fn do_handshake(&mut self) -> Result<bool> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut self.io) {
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.want_write = true;
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(&mut self.io) {
                    Ok(0) => return Err(Error::EndOfStream),
                    Ok(_) => {
                        let state = self.conn.process_new_packets()?;
                        self.buffered_plaintext = state.plaintext_bytes_to_read();
                        continue;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.want_read = true;
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            break;
        }

        trace!("TLS handshake complete");
        Ok(!self.conn.is_handshaking())
    }

    /// Read decrypted bytes into `buf`.
    ///
    /// `Ok(0)` means no progress is possible right now; check the direction
    /// hints. A clean or dirty peer close is `Err(EndOfStream)`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.want_read = false;
        self.want_write = false;

        if !self.do_handshake()? {
            return Ok(0);
        }

        loop {
            match self.conn.reader().read(buf) {
                Ok(0) => return Err(Error::EndOfStream),
                Ok(n) => {
                    self.buffered_plaintext = self.buffered_plaintext.saturating_sub(n);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.conn.read_tls(&mut self.io) {
                        Ok(0) => return Err(Error::EndOfStream),
                        Ok(_) => {
                            let state = self.conn.process_new_packets()?;
                            self.buffered_plaintext = state.plaintext_bytes_to_read();
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.want_read = true;
                            return Ok(0);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encrypt and send bytes from `buf`, returning how many were accepted.
    ///
    /// `Ok(0)` means the engine is blocked; check the direction hints.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.want_read = false;
        self.want_write = false;

        if !self.do_handshake()? {
            return Ok(0);
        }

        // Flush previously queued records before accepting more plaintext.
        if self.conn.wants_write() && !self.flush()? {
            return Ok(0);
        }

        let n = self.conn.writer().write(buf).map_err(Error::Io)?;

        self.flush()?;
        Ok(n)
    }

    /// Push queued TLS records to the socket. True once nothing is left.
    pub fn flush(&mut self) -> Result<bool> {
        self.want_write = false;
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.io) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.want_write = true;
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Attempt a graceful TLS shutdown; best effort on a non-blocking fd.
    pub fn shutdown(&mut self) {
        self.conn.send_close_notify();
        let _ = self.flush();
    }
}

/// Raw non-blocking fd as the engine's transport.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()))?;
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
