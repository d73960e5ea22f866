//! The epoll pool backend: a worker thread owns the per-fd transfer queues
//! and epoll interest; the loop thread sees only commands and results.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, trace};

use crate::event::{Activator, Event, EventFlags};
use crate::event_loop::EventLoop;
use crate::sys;
use crate::transfer::{Transfer, TransferCallback};

use super::{apply_progress, Command, FdPool, FdState, FdStatus, PoolResult, ProgressKind, TICK};

const WAKE_TOKEN: u64 = u64::MAX;

fn fd_events_to_epoll(events: u8) -> u32 {
    let mut mask = 0;
    if events & FdStatus::READ_EVENT != 0 {
        mask |= sys::epoll::READABLE;
    }
    if events & FdStatus::WRITE_EVENT != 0 {
        mask |= sys::epoll::WRITABLE;
    }
    mask
}

/// Worker-to-loop result channel plus the loop wakeup.
struct Outbox {
    results: mpsc::Sender<PoolResult>,
    notify: Activator,
}

impl Outbox {
    fn send(&self, result: PoolResult) {
        if self.results.send(result).is_ok() {
            self.notify.activate();
        }
    }

    fn complete(&self, transfer: Transfer) {
        self.send(PoolResult::Complete(transfer));
    }

    fn progress(&self, fd: RawFd, read: bool, kind: ProgressKind, time: Instant, value: usize) {
        self.send(PoolResult::Progress {
            fd,
            read,
            kind,
            time,
            value,
        });
    }

    fn status(&self, fd: RawFd, bits: u8) {
        self.send(PoolResult::Status(fd, bits));
    }

    fn flushed(&self, fd: RawFd) {
        self.send(PoolResult::Flushed(fd));
    }
}

struct TimeoutEntry {
    when: Instant,
    read: bool,
    fd: RawFd,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &TimeoutEntry) -> bool {
        self.when == other.when && self.fd == other.fd && self.read == other.read
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &TimeoutEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    // Inverted: the heap pops the earliest deadline.
    fn cmp(&self, other: &TimeoutEntry) -> Ordering {
        other.when.cmp(&self.when)
    }
}

/// Deadline heap with a membership set so each (fd, direction) appears once.
#[derive(Default)]
struct Timeouts {
    heap: BinaryHeap<TimeoutEntry>,
    members: HashSet<(RawFd, bool)>,
}

impl Timeouts {
    fn queue(&mut self, when: Instant, read: bool, fd: RawFd) {
        if self.members.insert((fd, read)) {
            self.heap.push(TimeoutEntry { when, read, fd });
        }
    }
}

/// One direction's transfer queue.
struct FdQueue {
    read: bool,
    q: VecDeque<Transfer>,
    closed: bool,
    timedout: bool,
    last: Option<Instant>,
    new_transfer: bool,
}

impl FdQueue {
    fn new(read: bool) -> FdQueue {
        FdQueue {
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
        self.q.front().map_or(false, |t| t.wants_read())
    }

    fn wants_write(&self) -> bool {
        self.q.front().map_or(false, |t| t.wants_write())
    }

    fn next_deadline(&self) -> Option<Instant> {
        let last = self.last?;
        let timeout = self.q.front()?.timeout()?;
        Some(last + timeout)
    }

    fn add(&mut self, transfer: Transfer, out: &Outbox) {
        if self.closed {
            out.complete(transfer);
        } else {
            self.q.push_back(transfer);
        }
    }

    fn update_timeout(&mut self, fd: RawFd, was_active: bool, now_active: bool, timeouts: &mut Timeouts) {
        if !now_active || self.closed {
            self.last = None;
        } else if !was_active {
            self.last = Some(Instant::now());
            if let Some(deadline) = self.next_deadline() {
                timeouts.queue(deadline, self.read, fd);
            }
        }
    }

    fn timeout(&mut self, fd: RawFd, now: Instant, timeouts: &mut Timeouts, out: &Outbox) {
        if self.closed {
            return;
        }
        let deadline = match self.next_deadline() {
            Some(deadline) => deadline,
            None => return,
        };

        if deadline < now {
            debug!(
                "{} timed out on fd={}",
                if self.read { "read" } else { "write" },
                fd
            );
            self.close(out);
            self.timedout = true;
        } else {
            timeouts.queue(deadline, self.read, fd);
        }
    }

    /// Run one attempt on the head transfer, reporting progress and popping
    /// it when done.
    fn transfer(&mut self, fd: RawFd, out: &Outbox) {
        if self.closed || self.q.is_empty() {
            return;
        }

        if self.new_transfer {
            self.new_transfer = false;
            let len = self.q.front().unwrap().length();
            out.progress(fd, self.read, ProgressKind::Size, Instant::now(), len);
        }

        let ret = self.q.front_mut().unwrap().transfer();

        if ret < 0 {
            self.close(out);
        } else {
            let now = Instant::now();
            self.last = Some(now);
            out.progress(fd, self.read, ProgressKind::Step, now, ret as usize);

            if self.q.front().unwrap().is_finished() {
                let transfer = self.q.pop_front().unwrap();
                out.progress(fd, self.read, ProgressKind::Finished, now, transfer.length());
                self.new_transfer = true;
                out.complete(transfer);
            }
        }
    }

    fn transfer_pending(&mut self, fd: RawFd, out: &Outbox) {
        while !self.closed && self.q.front().map_or(false, |t| t.is_pending()) {
            self.transfer(fd, out);
        }
    }

    /// Fail everything queued on this direction.
    fn close(&mut self, out: &Outbox) {
        self.closed = true;
        self.new_transfer = true;
        while let Some(transfer) = self.q.pop_front() {
            out.complete(transfer);
        }
    }
}

/// Worker-side per-fd scheduler state.
struct FdRec {
    fd: RawFd,
    events: u8,
    read_q: FdQueue,
    write_q: FdQueue,
}

impl FdRec {
    fn new(fd: RawFd) -> FdRec {
        FdRec {
            fd,
            events: 0,
            read_q: FdQueue::new(true),
            write_q: FdQueue::new(false),
        }
    }

    /// Desired epoll interest; TLS want-hints invert the natural direction.
    fn get_events(&self) -> u8 {
        if self.write_q.wants_read() {
            return FdStatus::READ_EVENT;
        }
        if self.read_q.wants_write() {
            return FdStatus::WRITE_EVENT;
        }

        (if self.read_q.is_active() {
            FdStatus::READ_EVENT
        } else {
            0
        }) | (if self.write_q.is_active() {
            FdStatus::WRITE_EVENT
        } else {
            0
        })
    }

    fn status(&self) -> u8 {
        self.get_events()
            | (if self.read_q.closed {
                FdStatus::READ_CLOSED
            } else {
                0
            })
            | (if self.write_q.closed {
                FdStatus::WRITE_CLOSED
            } else {
                0
            })
            | (if self.read_q.timedout {
                FdStatus::READ_TIMEDOUT
            } else {
                0
            })
            | (if self.write_q.timedout {
                FdStatus::WRITE_TIMEDOUT
            } else {
                0
            })
    }

    /// Route fired readiness to the queue that can use it.
    fn handle_events(
        &mut self,
        events: u8,
        selector: &sys::Selector,
        timeouts: &mut Timeouts,
        out: &Outbox,
    ) {
        let read = events & FdStatus::READ_EVENT != 0;
        let write = events & FdStatus::WRITE_EVENT != 0;

        if (write && self.read_q.wants_write()) || (read && !self.write_q.wants_read()) {
            self.read_q.transfer(self.fd, out);
        }
        if (read && self.write_q.wants_read()) || (write && !self.read_q.wants_write()) {
            self.write_q.transfer(self.fd, out);
        }

        self.update(selector, timeouts, out);
    }

    fn process(
        &mut self,
        cmd: Command,
        selector: &sys::Selector,
        timeouts: &mut Timeouts,
        out: &Outbox,
    ) {
        match cmd {
            Command::Read(t) if t.is_finished() => return out.complete(t),
            Command::Write(t) if t.is_finished() => return out.complete(t),
            Command::Read(t) => self.read_q.add(t, out),
            Command::Write(t) => self.write_q.add(t, out),
            Command::Flush(_) | Command::Shutdown => unreachable!("handled by the worker loop"),
        }

        self.update(selector, timeouts, out);
    }

    /// Recompute epoll interest; at most one `epoll_ctl` per change.
    fn update(&mut self, selector: &sys::Selector, timeouts: &mut Timeouts, out: &Outbox) {
        self.read_q.transfer_pending(self.fd, out);

        let new_events = self.get_events();
        if self.events == new_events {
            return;
        }

        let res = if self.events == 0 {
            selector.register(self.fd, self.fd as u64, fd_events_to_epoll(new_events))
        } else if new_events == 0 {
            selector.deregister(self.fd)
        } else {
            selector.reregister(self.fd, self.fd as u64, fd_events_to_epoll(new_events))
        };

        if let Err(e) = res {
            if new_events != 0 {
                error!("epoll_ctl failed for fd {}: {}", self.fd, e);
            }
        }

        self.read_q.update_timeout(
            self.fd,
            self.events & FdStatus::READ_EVENT != 0,
            new_events & FdStatus::READ_EVENT != 0,
            timeouts,
        );
        self.write_q.update_timeout(
            self.fd,
            self.events & FdStatus::WRITE_EVENT != 0,
            new_events & FdStatus::WRITE_EVENT != 0,
            timeouts,
        );

        self.events = new_events;
    }

    /// Fail both queues and retire the fd from epoll.
    fn flush(&mut self, selector: &sys::Selector, out: &Outbox) {
        self.read_q.close(out);
        self.write_q.close(out);
        if self.events != 0 {
            let _ = selector.deregister(self.fd);
        }
        out.flushed(self.fd);
    }
}

struct Worker {
    selector: sys::Selector,
    waker: Arc<sys::Waker>,
    cmds: mpsc::Receiver<Command>,
    recs: HashMap<RawFd, FdRec>,
    timeouts: Timeouts,
    out: Outbox,
}

impl Worker {
    fn run(mut self) {
        let mut events = sys::Events::with_capacity(1_024);
        let Worker {
            selector,
            waker,
            cmds,
            recs,
            timeouts,
            out,
        } = &mut self;

        loop {
            if let Err(e) = selector.select(&mut events, Some(TICK)) {
                error!("FD pool epoll_wait failed: {}", e);
                return;
            }

            let mut changed: HashMap<RawFd, u8> = HashMap::new();

            for i in 0..events.len() {
                if events.token(i) == WAKE_TOKEN {
                    waker.reset();
                    continue;
                }

                let fd = events.token(i) as RawFd;
                let (read, write) = events.readiness(i);
                let bits = (if read { FdStatus::READ_EVENT } else { 0 })
                    | (if write { FdStatus::WRITE_EVENT } else { 0 });

                if let Some(rec) = recs.get_mut(&fd) {
                    let old = rec.status();
                    rec.handle_events(bits, selector, timeouts, out);
                    let new = rec.status();
                    if old != new {
                        changed.insert(fd, new);
                    }
                }
            }

            loop {
                match cmds.try_recv() {
                    Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => return,
                    Err(mpsc::TryRecvError::Empty) => break,
                    Ok(Command::Flush(fd)) => {
                        trace!("flushing fd={}", fd);
                        changed.remove(&fd);
                        match recs.remove(&fd) {
                            Some(mut rec) => rec.flush(selector, out),
                            None => out.flushed(fd),
                        }
                    }
                    Ok(cmd) => {
                        let fd = match &cmd {
                            Command::Read(t) | Command::Write(t) => t.fd(),
                            _ => unreachable!(),
                        };
                        let rec = recs.entry(fd).or_insert_with(|| FdRec::new(fd));
                        let old = rec.status();
                        rec.process(cmd, selector, timeouts, out);
                        let new = rec.status();
                        if old != new {
                            changed.insert(fd, new);
                        }
                    }
                }
            }

            let now = Instant::now();
            while timeouts.heap.peek().map_or(false, |e| e.when < now) {
                let entry = timeouts.heap.pop().unwrap();
                timeouts.members.remove(&(entry.fd, entry.read));

                if let Some(rec) = recs.get_mut(&entry.fd) {
                    let old = rec.status();
                    if entry.read {
                        rec.read_q.timeout(entry.fd, now, timeouts, out);
                    } else {
                        rec.write_q.timeout(entry.fd, now, timeouts, out);
                    }
                    rec.update(selector, timeouts, out);
                    let new = rec.status();
                    if old != new {
                        changed.insert(entry.fd, new);
                    }
                }
            }

            for (fd, bits) in changed {
                out.status(fd, bits);
            }
        }
    }
}

/// Loop-side handle to the worker-thread pool.
pub struct EpollPool {
    cmd_tx: mpsc::Sender<Command>,
    results: mpsc::Receiver<PoolResult>,
    worker_waker: Arc<sys::Waker>,
    event: RefCell<Option<Event>>,
    completions: RefCell<HashMap<u64, TransferCallback>>,
    /// Callbacks failed synchronously (unknown or flushing fd); they still
    /// run from the drain event, never from inside the submit call.
    immediate: RefCell<VecDeque<TransferCallback>>,
    fds: RefCell<HashMap<RawFd, Rc<FdState>>>,
    flushing: RefCell<HashSet<RawFd>>,
    priority: Cell<usize>,
    worker: RefCell<Option<JoinHandle<()>>>,
}

impl EpollPool {
    pub(crate) fn new(base: &EventLoop) -> crate::Result<Rc<EpollPool>> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (res_tx, res_rx) = mpsc::channel();

        let worker_waker = Arc::new(sys::Waker::new()?);
        let selector = sys::Selector::new()?;
        selector.register(
            worker_waker.as_raw_fd(),
            WAKE_TOKEN,
            sys::epoll::READABLE,
        )?;

        let pool = Rc::new(EpollPool {
            cmd_tx,
            results: res_rx,
            worker_waker: worker_waker.clone(),
            event: RefCell::new(None),
            completions: RefCell::new(HashMap::new()),
            immediate: RefCell::new(VecDeque::new()),
            fds: RefCell::new(HashMap::new()),
            flushing: RefCell::new(HashSet::new()),
            priority: Cell::new(base.priorities() / 2),
            worker: RefCell::new(None),
        });

        let weak = Rc::downgrade(&pool);
        let event = base.new_event(
            move || {
                if let Some(pool) = weak.upgrade() {
                    pool.process_results();
                }
            },
            EventFlags::PERSIST,
        );
        event.set_priority(pool.priority.get());
        event.add();

        let notify = event.activator();
        *pool.event.borrow_mut() = Some(event);

        let worker = Worker {
            selector,
            waker: worker_waker,
            cmds: cmd_rx,
            recs: HashMap::new(),
            timeouts: Timeouts::default(),
            out: Outbox {
                results: res_tx,
                notify,
            },
        };

        let handle = thread::Builder::new()
            .name("evio-fd-pool".into())
            .spawn(move || worker.run())
            .map_err(crate::Error::Io)?;
        *pool.worker.borrow_mut() = Some(handle);

        Ok(pool)
    }

    fn submit(&self, write: bool, transfer: Transfer, cb: TransferCallback) {
        let fd = transfer.fd();
        let known =
            self.fds.borrow().contains_key(&fd) && !self.flushing.borrow().contains(&fd);
        if !known {
            return self.fail(cb);
        }

        let id = transfer.id();
        self.completions.borrow_mut().insert(id, cb);

        let cmd = if write {
            Command::Write(transfer)
        } else {
            Command::Read(transfer)
        };

        if self.cmd_tx.send(cmd).is_err() {
            if let Some(cb) = self.completions.borrow_mut().remove(&id) {
                self.fail(cb);
            }
            return;
        }
        let _ = self.worker_waker.wake();
    }

    fn fail(&self, cb: TransferCallback) {
        self.immediate.borrow_mut().push_back(cb);
        if let Some(event) = self.event.borrow().as_ref() {
            event.activate();
        }
    }

    /// Drain the result queue on the loop thread, in posting order.
    fn process_results(&self) {
        loop {
            let cb = self.immediate.borrow_mut().pop_front();
            match cb {
                Some(cb) => cb(false),
                None => break,
            }
        }

        while let Ok(result) = self.results.try_recv() {
            match result {
                PoolResult::Complete(transfer) => {
                    let cb = self.completions.borrow_mut().remove(&transfer.id());
                    if let Some(cb) = cb {
                        cb(transfer.is_success());
                    }
                }
                PoolResult::Flushed(fd) => {
                    trace!("fd={} flushed", fd);
                    sys::close(fd);
                    self.flushing.borrow_mut().remove(&fd);
                    self.fds.borrow_mut().remove(&fd);
                }
                PoolResult::Progress {
                    fd,
                    read,
                    kind,
                    time,
                    value,
                } => {
                    if self.flushing.borrow().contains(&fd) {
                        continue;
                    }
                    let state = self.fds.borrow().get(&fd).cloned();
                    if let Some(state) = state {
                        apply_progress(&state, read, kind, time, value);
                    }
                }
                PoolResult::Status(fd, bits) => {
                    if self.flushing.borrow().contains(&fd) {
                        continue;
                    }
                    let state = self.fds.borrow().get(&fd).cloned();
                    if let Some(state) = state {
                        state.set_status(FdStatus(bits));
                    }
                }
            }
        }
    }
}

impl FdPool for EpollPool {
    fn open(&self, fd: RawFd, state: Rc<FdState>) -> crate::Result<()> {
        if fd < 0 {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid fd {}", fd),
            )));
        }

        let mut fds = self.fds.borrow_mut();
        if fds.contains_key(&fd) {
            return Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("fd {} already in pool", fd),
            )));
        }
        fds.insert(fd, state);
        Ok(())
    }

    fn read(&self, transfer: Transfer, cb: TransferCallback) {
        self.submit(false, transfer, cb);
    }

    fn write(&self, transfer: Transfer, cb: TransferCallback) {
        self.submit(true, transfer, cb);
    }

    fn flush(&self, fd: RawFd) {
        if !self.fds.borrow().contains_key(&fd) {
            return;
        }
        if !self.flushing.borrow_mut().insert(fd) {
            return;
        }

        if self.cmd_tx.send(Command::Flush(fd)).is_ok() {
            let _ = self.worker_waker.wake();
        } else {
            // No worker to ack; retire the fd directly.
            sys::close(fd);
            self.flushing.borrow_mut().remove(&fd);
            self.fds.borrow_mut().remove(&fd);
        }
    }

    fn set_event_priority(&self, priority: usize) {
        self.priority.set(priority);
        if let Some(event) = self.event.borrow().as_ref() {
            event.set_priority(priority);
        }
    }

    fn event_priority(&self) -> usize {
        self.priority.get()
    }
}

impl Drop for EpollPool {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.worker_waker.wake();
        if let Some(handle) = self.worker.borrow_mut().take() {
            let _ = handle.join();
        }
    }
}
