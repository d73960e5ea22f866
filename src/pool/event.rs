//! Fallback pool backend driven entirely from the event loop thread: no
//! worker, no queues between threads, identical semantics.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::{debug, trace};

use crate::event::{Event, EventFlags, EventSet};
use crate::event_loop::EventLoop;
use crate::sys;
use crate::transfer::{Transfer, TransferCallback};

use super::{FdPool, FdState, FdStatus};

struct LoopQueue {
    read: bool,
    q: VecDeque<(Transfer, TransferCallback)>,
    closed: bool,
    timedout: bool,
    last: Option<Instant>,
    new_transfer: bool,
}

impl LoopQueue {
    fn new(read: bool) -> LoopQueue {
        LoopQueue {
            read,
            q: VecDeque::new(),
            closed: false,
            timedout: false,
            last: None,
            new_transfer: true,
        }
    }

    fn is_active(&self) -> bool {
        !self.q.is_empty() && !self.closed
    }

    fn wants_read(&self) -> bool {
        self.q.front().map_or(false, |(t, _)| t.wants_read())
    }

    fn wants_write(&self) -> bool {
        self.q.front().map_or(false, |(t, _)| t.wants_write())
    }

    fn next_deadline(&self) -> Option<Instant> {
        let last = self.last?;
        let timeout = self.q.front().and_then(|(t, _)| t.timeout())?;
        Some(last + timeout)
    }

    fn add(&mut self, transfer: Transfer, cb: TransferCallback, pool: &LoopPool) {
        if self.closed {
            return pool.defer_complete(cb, transfer.is_success() && transfer.is_finished());
        }
        if self.q.is_empty() {
            self.last = Some(Instant::now());
        }
        self.q.push_back((transfer, cb));
        self.pop_finished(pool);
    }

    fn transfer(&mut self, state: &FdState, pool: &LoopPool) {
        if self.closed || self.q.is_empty() {
            return;
        }

        if self.new_transfer {
            self.new_transfer = false;
            let len = self.q.front().unwrap().0.length();
            state.progress_start(self.read, len, Instant::now());
        }

        let ret = self.q.front_mut().unwrap().0.transfer();
        let now = Instant::now();
        self.last = Some(now);

        if ret < 0 {
            self.close(pool);
        } else {
            state.progress_event(self.read, ret as usize, now);

            if self.q.front().unwrap().0.is_finished() {
                state.progress_end(self.read, self.q.front().unwrap().0.length());
                self.pop_finished(pool);
            }
        }
    }

    fn transfer_pending(&mut self, state: &FdState, pool: &LoopPool) {
        while !self.closed && self.q.front().map_or(false, |(t, _)| t.is_pending()) {
            self.transfer(state, pool);
        }
    }

    fn pop_finished(&mut self, pool: &LoopPool) {
        while self.q.front().map_or(false, |(t, _)| t.is_finished()) {
            let (transfer, cb) = self.q.pop_front().unwrap();
            self.new_transfer = true;
            pool.defer_complete(cb, transfer.is_success());
        }
    }

    fn check_timeout(&mut self, fd: RawFd, now: Instant, pool: &LoopPool) {
        if let Some(deadline) = self.next_deadline() {
            if !self.closed && deadline <= now {
                debug!(
                    "{} timed out on fd={}",
                    if self.read { "read" } else { "write" },
                    fd
                );
                self.close(pool);
                self.timedout = true;
            }
        }
    }

    fn close(&mut self, pool: &LoopPool) {
        self.closed = true;
        self.new_transfer = true;
        while let Some((transfer, cb)) = self.q.pop_front() {
            pool.defer_complete(cb, transfer.is_success() && transfer.is_finished());
        }
    }
}

struct LoopFdRec {
    weak: RefCell<Weak<LoopFdRec>>,
    pool: Weak<LoopPool>,
    fd: RawFd,
    state: Rc<FdState>,
    events: Cell<u8>,
    event: RefCell<Option<Event>>,
    timeout_event: RefCell<Option<Event>>,
    read_q: RefCell<LoopQueue>,
    write_q: RefCell<LoopQueue>,
}

impl LoopFdRec {
    fn new(pool: &Rc<LoopPool>, fd: RawFd, state: Rc<FdState>) -> Rc<LoopFdRec> {
        let rec = Rc::new(LoopFdRec {
            weak: RefCell::new(Weak::new()),
            pool: Rc::downgrade(pool),
            fd,
            state,
            events: Cell::new(0),
            event: RefCell::new(None),
            timeout_event: RefCell::new(None),
            read_q: RefCell::new(LoopQueue::new(true)),
            write_q: RefCell::new(LoopQueue::new(false)),
        });
        *rec.weak.borrow_mut() = Rc::downgrade(&rec);
        rec
    }

    fn get_events(&self) -> u8 {
        if self.write_q.borrow().wants_read() {
            return FdStatus::READ_EVENT;
        }
        if self.read_q.borrow().wants_write() {
            return FdStatus::WRITE_EVENT;
        }

        (if self.read_q.borrow().is_active() {
            FdStatus::READ_EVENT
        } else {
            0
        }) | (if self.write_q.borrow().is_active() {
            FdStatus::WRITE_EVENT
        } else {
            0
        })
    }

    fn status(&self) -> u8 {
        let read_q = self.read_q.borrow();
        let write_q = self.write_q.borrow();
        self.get_events()
            | (if read_q.closed { FdStatus::READ_CLOSED } else { 0 })
            | (if write_q.closed { FdStatus::WRITE_CLOSED } else { 0 })
            | (if read_q.timedout { FdStatus::READ_TIMEDOUT } else { 0 })
            | (if write_q.timedout { FdStatus::WRITE_TIMEDOUT } else { 0 })
    }

    fn callback(&self, what: EventSet) {
        trace!("fd={} pool event {:?}", self.fd, what);

        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => return,
        };

        let read = what.contains(EventSet::READ);
        let write = what.contains(EventSet::WRITE);

        if read || (write && self.read_q.borrow().wants_write()) {
            self.read_q.borrow_mut().transfer(&self.state, &pool);
        }
        if write || (read && self.write_q.borrow().wants_read()) {
            self.write_q.borrow_mut().transfer(&self.state, &pool);
        }

        self.update(&pool);
    }

    fn update(&self, pool: &LoopPool) {
        self.read_q.borrow_mut().transfer_pending(&self.state, pool);
        self.update_event(pool);
        self.update_timeout(pool);
        self.state.set_status(FdStatus(self.status()));
    }

    /// Swap the fd event for one matching the desired interest.
    fn update_event(&self, pool: &LoopPool) {
        let events = self.get_events();
        if self.events.get() == events {
            return;
        }
        self.events.set(events);

        if let Some(event) = self.event.borrow_mut().take() {
            event.del();
        }
        if events == 0 {
            return;
        }

        let mut interest = EventSet::NONE;
        if events & FdStatus::READ_EVENT != 0 {
            interest.insert(EventSet::READ);
        }
        if events & FdStatus::WRITE_EVENT != 0 {
            interest.insert(EventSet::WRITE);
        }

        let weak = self.weak.borrow().clone();
        let event = pool.base.new_fd_event(
            self.fd,
            interest,
            EventFlags::PERSIST,
            move |what| {
                if let Some(rec) = weak.upgrade() {
                    rec.callback(what);
                }
            },
        );
        event.set_priority(pool.priority.get());
        event.add();
        *self.event.borrow_mut() = Some(event);
    }

    fn update_timeout(&self, pool: &LoopPool) {
        let read_deadline = self.read_q.borrow().next_deadline();
        let write_deadline = self.write_q.borrow().next_deadline();

        let deadline = match (read_deadline, write_deadline) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        };

        let deadline = match deadline {
            Some(deadline) => deadline,
            None => {
                if let Some(event) = self.timeout_event.borrow_mut().take() {
                    event.del();
                }
                return;
            }
        };

        if self.timeout_event.borrow().is_none() {
            let weak = self.weak.borrow().clone();
            let event = pool.base.new_event(
                move || {
                    if let Some(rec) = weak.upgrade() {
                        rec.timeout();
                    }
                },
                EventFlags::NO_SELF_REF,
            );
            event.set_priority(pool.priority.get());
            *self.timeout_event.borrow_mut() = Some(event);
        }

        let delay = deadline.saturating_duration_since(Instant::now());
        self.timeout_event.borrow().as_ref().unwrap().add_timeout(delay);
    }

    fn timeout(&self) {
        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => return,
        };

        let now = Instant::now();
        self.read_q.borrow_mut().check_timeout(self.fd, now, &pool);
        self.write_q.borrow_mut().check_timeout(self.fd, now, &pool);
        self.update(&pool);
    }

    fn flush(&self, pool: &LoopPool) {
        self.read_q.borrow_mut().close(pool);
        self.write_q.borrow_mut().close(pool);

        if let Some(event) = self.event.borrow_mut().take() {
            event.del();
        }
        if let Some(event) = self.timeout_event.borrow_mut().take() {
            event.del();
        }
        self.state.set_status(FdStatus(self.status()));
    }
}

/// Pool backend with no worker thread: one loop event per fd direction.
pub struct LoopPool {
    weak: RefCell<Weak<LoopPool>>,
    base: EventLoop,
    recs: RefCell<HashMap<RawFd, Rc<LoopFdRec>>>,
    completions: RefCell<VecDeque<(TransferCallback, bool)>>,
    complete_event: RefCell<Option<Event>>,
    flushed: RefCell<Vec<RawFd>>,
    flush_event: RefCell<Option<Event>>,
    priority: Cell<usize>,
}

impl LoopPool {
    pub(crate) fn new(base: &EventLoop) -> Rc<LoopPool> {
        let pool = Rc::new(LoopPool {
            weak: RefCell::new(Weak::new()),
            base: base.clone(),
            recs: RefCell::new(HashMap::new()),
            completions: RefCell::new(VecDeque::new()),
            complete_event: RefCell::new(None),
            flushed: RefCell::new(Vec::new()),
            flush_event: RefCell::new(None),
            priority: Cell::new(base.priorities() / 2),
        });
        *pool.weak.borrow_mut() = Rc::downgrade(&pool);

        let weak = Rc::downgrade(&pool);
        let complete_event = base.new_event(
            move || {
                if let Some(pool) = weak.upgrade() {
                    pool.run_completions();
                }
            },
            EventFlags::PERSIST,
        );
        complete_event.add();
        *pool.complete_event.borrow_mut() = Some(complete_event);

        let weak = Rc::downgrade(&pool);
        let flush_event = base.new_event(
            move || {
                if let Some(pool) = weak.upgrade() {
                    pool.close_flushed();
                }
            },
            EventFlags::PERSIST,
        );
        flush_event.add();
        *pool.flush_event.borrow_mut() = Some(flush_event);

        pool
    }

    /// Completions run from their own event so transfer submission never
    /// re-enters user code synchronously.
    fn defer_complete(&self, cb: TransferCallback, success: bool) {
        self.completions.borrow_mut().push_back((cb, success));
        if let Some(event) = self.complete_event.borrow().as_ref() {
            event.activate();
        }
    }

    fn run_completions(&self) {
        loop {
            let next = self.completions.borrow_mut().pop_front();
            match next {
                Some((cb, success)) => cb(success),
                None => break,
            }
        }
    }

    fn close_flushed(&self) {
        let fds = std::mem::take(&mut *self.flushed.borrow_mut());
        for fd in fds {
            trace!("fd={} flushed", fd);
            sys::close(fd);
        }
    }

    fn strong(&self) -> Rc<LoopPool> {
        self.weak
            .borrow()
            .upgrade()
            .expect("pool outlived its handle")
    }

    fn submit(&self, write: bool, transfer: Transfer, cb: TransferCallback) {
        if transfer.is_finished() {
            return self.defer_complete(cb, transfer.is_success());
        }

        let rec = self.recs.borrow().get(&transfer.fd()).cloned();
        let rec = match rec {
            Some(rec) => rec,
            None => return self.defer_complete(cb, false),
        };

        {
            let mut q = if write {
                rec.write_q.borrow_mut()
            } else {
                rec.read_q.borrow_mut()
            };
            q.add(transfer, cb, self);
        }
        rec.update(self);
    }
}

impl FdPool for LoopPool {
    fn open(&self, fd: RawFd, state: Rc<FdState>) -> crate::Result<()> {
        if fd < 0 {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid fd {}", fd),
            )));
        }

        let mut recs = self.recs.borrow_mut();
        if recs.contains_key(&fd) {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("fd {} already in pool", fd),
            )));
        }

        recs.insert(fd, LoopFdRec::new(&self.strong(), fd, state));
        Ok(())
    }

    fn read(&self, transfer: Transfer, cb: TransferCallback) {
        self.submit(false, transfer, cb);
    }

    fn write(&self, transfer: Transfer, cb: TransferCallback) {
        self.submit(true, transfer, cb);
    }

    fn flush(&self, fd: RawFd) {
        let rec = self.recs.borrow_mut().remove(&fd);
        let rec = match rec {
            Some(rec) => rec,
            None => return,
        };

        rec.flush(&self.strong());

        self.flushed.borrow_mut().push(fd);
        if let Some(event) = self.flush_event.borrow().as_ref() {
            event.activate();
        }
    }

    fn set_event_priority(&self, priority: usize) {
        self.priority.set(priority);
    }

    fn event_priority(&self) -> usize {
        self.priority.get()
    }
}
