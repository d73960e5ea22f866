use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use log::trace;

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::net::tls::SharedTls;
use crate::pool::{FdPool, FdState, FdStatus};
use crate::progress::Progress;
use crate::transfer::Transfer;

/// Event-loop-side owner of a file descriptor.
///
/// Creating an `Fd` registers the descriptor with the loop's pool; from then
/// on the pool owns all I/O on it. [`close`] (or drop) flushes the pool side,
/// failing outstanding transfers, and the OS descriptor is closed once the
/// pool acknowledges.
///
/// [`close`]: Fd::close
pub struct Fd {
    base: EventLoop,
    pool: Rc<dyn FdPool>,
    fd: Cell<RawFd>,
    tls: RefCell<Option<SharedTls>>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
    state: Rc<FdState>,
}

impl Fd {
    /// Take ownership of `fd` and register it with the pool.
    ///
    /// Fails if the descriptor is negative or already registered.
    pub fn new(base: &EventLoop, fd: RawFd, tls: Option<SharedTls>) -> crate::Result<Fd> {
        let state = FdState::new(fd);
        let pool = base.pool()?;
        pool.open(fd, state.clone())?;
        trace!("fd={} opened", fd);

        Ok(Fd {
            base: base.clone(),
            pool,
            fd: Cell::new(fd),
            tls: RefCell::new(tls),
            read_timeout: Cell::new(None),
            write_timeout: Cell::new(None),
            state,
        })
    }

    pub fn raw(&self) -> RawFd {
        self.fd.get()
    }

    pub fn base(&self) -> &EventLoop {
        &self.base
    }

    pub fn is_open(&self) -> bool {
        self.fd.get() != -1
    }

    pub fn is_secure(&self) -> bool {
        self.tls.borrow().is_some()
    }

    pub fn set_tls(&self, tls: Option<SharedTls>) {
        *self.tls.borrow_mut() = tls;
    }

    pub(crate) fn tls(&self) -> Option<SharedTls> {
        self.tls.borrow().clone()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.read_timeout.set(timeout);
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.write_timeout.set(timeout);
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout.get()
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout.get()
    }

    /// Composite status bits as last reported by the pool.
    pub fn status(&self) -> FdStatus {
        self.state.status()
    }

    pub fn read_progress(&self) -> Progress {
        self.state.read_progress()
    }

    pub fn write_progress(&self) -> Progress {
        self.state.write_progress()
    }

    /// Instantaneous transfer rate in bytes per second.
    pub fn rate(&self, read: bool) -> f64 {
        self.state.rate(read)
    }

    /// Submit a prepared read-direction transfer.
    pub fn read_transfer<F>(&self, mut transfer: Transfer, cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        transfer.set_timeout(self.read_timeout.get());
        self.pool.read(transfer, Box::new(cb));
    }

    /// Read until `buf` holds `length` bytes.
    pub fn read_bytes<F>(&self, buf: &Buffer, length: usize, cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let t = Transfer::read_bytes(self.fd.get(), self.tls(), buf.clone(), length);
        self.read_transfer(t, cb);
    }

    /// Read until `mark` appears in `buf`, bounded by `max` bytes.
    ///
    /// Overflow past `max` completes successfully; the caller detects it
    /// from the buffer length.
    pub fn read_until<F>(&self, buf: &Buffer, max: usize, mark: &[u8], cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let t = Transfer::read_until(self.fd.get(), self.tls(), buf.clone(), max, mark);
        self.read_transfer(t, cb);
    }

    /// Fire `cb` once the descriptor is readable.
    pub fn can_read<F>(&self, cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let t = Transfer::readiness(self.fd.get(), self.tls());
        self.read_transfer(t, cb);
    }

    /// Submit a prepared write-direction transfer.
    pub fn write_transfer<F>(&self, mut transfer: Transfer, cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        transfer.set_timeout(self.write_timeout.get());
        self.pool.write(transfer, Box::new(cb));
    }

    /// Drain `buf` to the descriptor.
    pub fn write_buffer<F>(&self, buf: &Buffer, cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let t = Transfer::write(self.fd.get(), self.tls(), buf.clone());
        self.write_transfer(t, cb);
    }

    /// Fire `cb` once the descriptor is writable.
    pub fn can_write<F>(&self, cb: F)
    where
        F: FnOnce(bool) + 'static,
    {
        let t = Transfer::readiness(self.fd.get(), self.tls());
        self.write_transfer(t, cb);
    }

    /// Cancel outstanding transfers and close the descriptor.
    ///
    /// Pending transfer callbacks still run, each exactly once with
    /// `success = false`. The OS descriptor closes when the pool
    /// acknowledges the flush.
    pub fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd != -1 {
            trace!("fd={} closing", fd);
            if let Some(tls) = self.tls.borrow_mut().take() {
                crate::net::tls::lock(&tls).shutdown();
            }
            self.pool.flush(fd);
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd")
            .field("fd", &self.fd.get())
            .field("secure", &self.is_secure())
            .finish()
    }
}
