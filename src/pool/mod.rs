//! FD pools: they own per-fd transfer queues and drive the actual I/O.

mod epoll;
mod event;

pub use epoll::EpollPool;
pub use event::LoopPool;

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::progress::{Progress, RateTracker};
use crate::transfer::{Transfer, TransferCallback};

/// Which implementation drives transfers for an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolBackend {
    /// A dedicated worker thread running its own epoll loop.
    #[default]
    Epoll,
    /// Everything on the event loop thread, one event per fd direction.
    Loop,
}

/// Composite per-fd status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdStatus(pub(crate) u8);

impl FdStatus {
    pub(crate) const READ_EVENT: u8 = 1 << 0;
    pub(crate) const WRITE_EVENT: u8 = 1 << 1;
    pub(crate) const READ_CLOSED: u8 = 1 << 4;
    pub(crate) const WRITE_CLOSED: u8 = 1 << 5;
    pub(crate) const READ_TIMEDOUT: u8 = 1 << 6;
    pub(crate) const WRITE_TIMEDOUT: u8 = 1 << 7;

    pub fn wants_read_event(self) -> bool {
        self.0 & Self::READ_EVENT != 0
    }

    pub fn wants_write_event(self) -> bool {
        self.0 & Self::WRITE_EVENT != 0
    }

    pub fn read_closed(self) -> bool {
        self.0 & Self::READ_CLOSED != 0
    }

    pub fn write_closed(self) -> bool {
        self.0 & Self::WRITE_CLOSED != 0
    }

    pub fn read_timedout(self) -> bool {
        self.0 & Self::READ_TIMEDOUT != 0
    }

    pub fn write_timedout(self) -> bool {
        self.0 & Self::WRITE_TIMEDOUT != 0
    }
}

/// Loop-side per-fd accounting, shared between the pool and the [`Fd`]
/// handle.
///
/// [`Fd`]: crate::Fd
pub struct FdState {
    fd: RawFd,
    status: Cell<FdStatus>,
    read_progress: RefCell<Progress>,
    write_progress: RefCell<Progress>,
    read_rate: RefCell<RateTracker>,
    write_rate: RefCell<RateTracker>,
}

impl FdState {
    pub(crate) fn new(fd: RawFd) -> Rc<FdState> {
        Rc::new(FdState {
            fd,
            status: Cell::new(FdStatus::default()),
            read_progress: RefCell::new(Progress::default()),
            write_progress: RefCell::new(Progress::default()),
            read_rate: RefCell::new(RateTracker::default()),
            write_rate: RefCell::new(RateTracker::default()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn status(&self) -> FdStatus {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: FdStatus) {
        self.status.set(status);
    }

    pub fn read_progress(&self) -> Progress {
        self.read_progress.borrow().clone()
    }

    pub fn write_progress(&self) -> Progress {
        self.write_progress.borrow().clone()
    }

    /// Instantaneous rate in bytes per second for one direction.
    pub fn rate(&self, read: bool) -> f64 {
        let now = Instant::now();
        if read {
            self.read_rate.borrow_mut().rate(now)
        } else {
            self.write_rate.borrow_mut().rate(now)
        }
    }

    pub(crate) fn progress_start(&self, read: bool, size: usize, time: Instant) {
        let mut p = if read {
            self.read_progress.borrow_mut()
        } else {
            self.write_progress.borrow_mut()
        };
        p.reset();
        p.set_size(size);
        p.begin(time);
    }

    pub(crate) fn progress_event(&self, read: bool, bytes: usize, time: Instant) {
        if read {
            self.read_progress.borrow_mut().event(bytes, time);
            self.read_rate.borrow_mut().event(bytes, time);
        } else {
            self.write_progress.borrow_mut().event(bytes, time);
            self.write_rate.borrow_mut().event(bytes, time);
        }
    }

    pub(crate) fn progress_end(&self, read: bool, size: usize) {
        let mut p = if read {
            self.read_progress.borrow_mut()
        } else {
            self.write_progress.borrow_mut()
        };
        p.set_size(size);
    }
}

/// Loop-side interface to an FD pool backend.
///
/// Transfers submitted on a given direction of a given fd complete in
/// submission order; completion callbacks always run on the loop thread,
/// exactly once each.
pub trait FdPool {
    /// Register `fd` with the pool. Each fd value may be registered once.
    fn open(&self, fd: RawFd, state: Rc<FdState>) -> crate::Result<()>;

    /// Queue a read-direction transfer.
    fn read(&self, transfer: Transfer, cb: TransferCallback);

    /// Queue a write-direction transfer.
    fn write(&self, transfer: Transfer, cb: TransferCallback);

    /// Fail all pending transfers on `fd`, then close and forget the OS fd.
    fn flush(&self, fd: RawFd);

    /// Priority of the pool's own loop events.
    fn set_event_priority(&self, priority: usize);
    fn event_priority(&self) -> usize;
}

/// Commands from the loop thread to the pool worker.
pub(crate) enum Command {
    Read(Transfer),
    Write(Transfer),
    Flush(RawFd),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgressKind {
    /// A transfer began; value is its declared length.
    Size,
    /// Bytes moved since the last report.
    Step,
    /// The transfer's end was reached; value is its final length.
    Finished,
}

/// Results from the pool worker back to the loop thread.
pub(crate) enum PoolResult {
    Complete(Transfer),
    Flushed(RawFd),
    Progress {
        fd: RawFd,
        read: bool,
        kind: ProgressKind,
        time: Instant,
        value: usize,
    },
    Status(RawFd, u8),
}

pub(crate) fn apply_progress(
    state: &FdState,
    read: bool,
    kind: ProgressKind,
    time: Instant,
    value: usize,
) {
    match kind {
        ProgressKind::Size => state.progress_start(read, value, time),
        ProgressKind::Step => state.progress_event(read, value, time),
        ProgressKind::Finished => state.progress_end(read, value),
    }
}

/// How long the worker sleeps at most between timeout scans.
pub(crate) const TICK: Duration = Duration::from_millis(100);
