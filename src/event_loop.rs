use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::trace;

use crate::dns::Dns;
use crate::event::{Callback, CrossState, Event, EventCore, EventFlags, EventSet};
use crate::pool::{EpollPool, FdPool, LoopPool, PoolBackend};
use crate::sys;

const WAKER_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;

/// Configure event loop runtime details.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Number of dispatch priorities. Events carry a priority in
    /// `0..priorities`; lower numbers fire first within a tick.
    pub priorities: usize,
    /// Capacity of the readiness event buffer per poll.
    pub events_capacity: usize,
    /// Which FD pool backend drives transfers.
    pub pool: PoolBackend,
}

impl Default for LoopConfig {
    fn default() -> LoopConfig {
        LoopConfig {
            priorities: 4,
            events_capacity: 1_024,
            pool: PoolBackend::Epoll,
        }
    }
}

/// Single-threaded cooperative scheduler of timers, fd readiness, signals
/// and activations.
///
/// All user callbacks run on the thread calling [`run`]. Cross-thread input
/// arrives only through [`Activator`] handles, which wake the loop via an
/// eventfd.
///
/// [`run`]: EventLoop::run
/// [`Activator`]: crate::Activator
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

struct FdSlots {
    read: Option<u64>,
    write: Option<u64>,
    edge: bool,
    registered: bool,
}

struct TimerEntry {
    when: Instant,
    seq: u64,
    id: u64,
    gen: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Inverted so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct Inner {
    selector: sys::Selector,
    pub(crate) cross: Arc<CrossState>,
    events: RefCell<sys::Events>,
    registry: RefCell<HashMap<u64, std::rc::Weak<EventCore>>>,
    fd_table: RefCell<HashMap<RawFd, FdSlots>>,
    signal_fd: RefCell<Option<sys::SignalFd>>,
    signal_table: RefCell<HashMap<libc::c_int, u64>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    active: RefCell<Vec<VecDeque<u64>>>,
    next_id: Cell<u64>,
    next_seq: Cell<u64>,
    break_flag: Cell<bool>,
    exit_flag: Cell<bool>,
    priorities: usize,
    pool_backend: PoolBackend,
    pool: RefCell<Option<Rc<dyn FdPool>>>,
    dns: RefCell<Option<Rc<Dns>>>,
}

impl EventLoop {
    pub fn new() -> crate::Result<EventLoop> {
        EventLoop::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> crate::Result<EventLoop> {
        crate::init();

        let selector = sys::Selector::new()?;
        let waker = sys::Waker::new()?;
        selector.register(waker.as_raw_fd(), WAKER_TOKEN, sys::epoll::READABLE)?;

        let inner = Rc::new(Inner {
            selector,
            cross: Arc::new(CrossState {
                pending: Mutex::new(Vec::new()),
                waker,
            }),
            events: RefCell::new(sys::Events::with_capacity(config.events_capacity)),
            registry: RefCell::new(HashMap::new()),
            fd_table: RefCell::new(HashMap::new()),
            signal_fd: RefCell::new(None),
            signal_table: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            active: RefCell::new(vec![VecDeque::new(); config.priorities.max(1)]),
            next_id: Cell::new(0),
            next_seq: Cell::new(0),
            break_flag: Cell::new(false),
            exit_flag: Cell::new(false),
            priorities: config.priorities.max(1),
            pool_backend: config.pool,
            pool: RefCell::new(None),
            dns: RefCell::new(None),
        });

        Ok(EventLoop { inner })
    }

    /// Number of configured dispatch priorities.
    pub fn priorities(&self) -> usize {
        self.inner.priorities
    }

    /// Create a timer or activation event.
    pub fn new_event<F>(&self, cb: F, flags: EventFlags) -> Event
    where
        F: FnMut() + 'static,
    {
        self.make_event(-1, EventSet::NONE, flags, Callback::Simple(Box::new(cb)))
    }

    /// Create an fd readiness or signal event.
    ///
    /// For `SIGNAL` events `fd` is the signal number. `events` may include
    /// `READ`, `WRITE` and `EDGE_TRIG`.
    pub fn new_fd_event<F>(&self, fd: RawFd, events: EventSet, flags: EventFlags, cb: F) -> Event
    where
        F: FnMut(EventSet) + 'static,
    {
        self.make_event(fd, events, flags, Callback::Fd(Box::new(cb)))
    }

    fn make_event(&self, fd: RawFd, interest: EventSet, flags: EventFlags, cb: Callback) -> Event {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let core = Rc::new(EventCore {
            id,
            flags,
            fd,
            interest,
            priority: Cell::new(self.inner.priorities / 2),
            cb: RefCell::new(Some(cb)),
            armed: Cell::new(false),
            queued: Cell::new(false),
            fired: Cell::new(EventSet::NONE),
            timeout: Cell::new(None),
            timer_gen: Cell::new(0),
            finalized: Cell::new(false),
            self_ref: RefCell::new(None),
        });

        self.inner
            .registry
            .borrow_mut()
            .insert(id, Rc::downgrade(&core));

        Event {
            core,
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// The FD pool driving transfers for this loop, created on first use.
    ///
    /// Creation can fail on fd exhaustion or a failed worker start; the
    /// condition is transient, so it surfaces to the caller instead of
    /// taking the loop down.
    pub fn pool(&self) -> crate::Result<Rc<dyn FdPool>> {
        if let Some(pool) = self.inner.pool.borrow().as_ref() {
            return Ok(pool.clone());
        }

        let pool: Rc<dyn FdPool> = match self.inner.pool_backend {
            PoolBackend::Epoll => EpollPool::new(self)?,
            PoolBackend::Loop => LoopPool::new(self),
        };
        *self.inner.pool.borrow_mut() = Some(pool.clone());
        Ok(pool)
    }

    /// The async DNS resolver bound to this loop, created on first use.
    pub fn dns(&self) -> Rc<Dns> {
        if let Some(dns) = self.inner.dns.borrow().as_ref() {
            return dns.clone();
        }

        let dns = Dns::new(self);
        *self.inner.dns.borrow_mut() = Some(dns.clone());
        dns
    }

    /// Dispatch events until [`break_loop`] or [`exit_loop`] is called.
    ///
    /// [`break_loop`]: EventLoop::break_loop
    /// [`exit_loop`]: EventLoop::exit_loop
    pub fn run(&self) -> crate::Result<()> {
        self.inner.break_flag.set(false);
        self.inner.exit_flag.set(false);

        loop {
            self.inner.tick(true)?;
            if self.inner.break_flag.get() || self.inner.exit_flag.get() {
                return Ok(());
            }
        }
    }

    /// Dispatch one tick, blocking until something is ready.
    pub fn run_once(&self) -> crate::Result<()> {
        self.inner.tick(true)?;
        Ok(())
    }

    /// Dispatch whatever is ready right now without blocking.
    pub fn run_nonblock(&self) -> crate::Result<()> {
        self.inner.tick(false)?;
        Ok(())
    }

    /// Stop dispatching as soon as the current callback returns.
    pub fn break_loop(&self) {
        self.inner.break_flag.set(true);
    }

    /// Exit [`run`] once the current tick completes.
    ///
    /// [`run`]: EventLoop::run
    pub fn exit_loop(&self) {
        self.inner.exit_flag.set(true);
    }

    pub(crate) fn inner(&self) -> &Rc<Inner> {
        &self.inner
    }
}

impl Inner {
    fn lookup(&self, id: u64) -> Option<Rc<EventCore>> {
        let core = self.registry.borrow().get(&id).and_then(|w| w.upgrade());
        if core.is_none() {
            self.registry.borrow_mut().remove(&id);
        }
        core
    }

    pub(crate) fn arm(&self, core: &Rc<EventCore>, timeout: Option<Duration>) {
        if core.armed.get() {
            self.del_core(core);
        }

        trace!("arm event id={} fd={} timeout={:?}", core.id, core.fd, timeout);

        core.armed.set(true);
        core.timeout.set(timeout);

        if !core.flags.contains(EventFlags::NO_SELF_REF) {
            *core.self_ref.borrow_mut() = Some(core.clone());
        }

        if core.is_signal_event() {
            self.arm_signal(core);
        } else if core.is_fd_event() {
            self.arm_fd(core);
        }

        if let Some(t) = timeout {
            self.arm_timer(core, t);
        }
    }

    fn arm_fd(&self, core: &Rc<EventCore>) {
        let mut table = self.fd_table.borrow_mut();
        let slots = table.entry(core.fd).or_insert(FdSlots {
            read: None,
            write: None,
            edge: false,
            registered: false,
        });

        if core.interest.contains(EventSet::READ) {
            slots.read = Some(core.id);
        }
        if core.interest.contains(EventSet::WRITE) {
            slots.write = Some(core.id);
        }
        if core.interest.contains(EventSet::EDGE_TRIG) {
            slots.edge = true;
        }

        Self::sync_fd(&self.selector, core.fd, slots);
        if slots.read.is_none() && slots.write.is_none() {
            table.remove(&core.fd);
        }
    }

    /// Push the slot state into epoll with a single ctl op.
    fn sync_fd(selector: &sys::Selector, fd: RawFd, slots: &mut FdSlots) {
        let mut mask = 0;
        if slots.read.is_some() {
            mask |= sys::epoll::READABLE;
        }
        if slots.write.is_some() {
            mask |= sys::epoll::WRITABLE;
        }
        if slots.edge {
            mask |= sys::epoll::EDGE;
        }

        let res = if !slots.registered {
            if mask == 0 {
                return;
            }
            slots.registered = true;
            selector.register(fd, fd as u64, mask)
        } else if mask == 0 {
            slots.registered = false;
            selector.deregister(fd)
        } else {
            selector.reregister(fd, fd as u64, mask)
        };

        if let Err(e) = res {
            log::error!("epoll_ctl failed for fd {}: {}", fd, e);
        }
    }

    fn arm_signal(&self, core: &Rc<EventCore>) {
        let mut sfd = self.signal_fd.borrow_mut();
        if sfd.is_none() {
            match sys::SignalFd::new() {
                Ok(s) => {
                    if let Err(e) =
                        self.selector
                            .register(s.as_raw_fd(), SIGNAL_TOKEN, sys::epoll::READABLE)
                    {
                        log::error!("failed to register signalfd: {}", e);
                        return;
                    }
                    *sfd = Some(s);
                }
                Err(e) => {
                    log::error!("failed to create signalfd: {}", e);
                    return;
                }
            }
        }

        if let Some(s) = sfd.as_mut() {
            if let Err(e) = s.add(core.fd) {
                log::error!("failed to watch signal {}: {}", core.fd, e);
                return;
            }
        }
        self.signal_table.borrow_mut().insert(core.fd, core.id);
    }

    fn arm_timer(&self, core: &Rc<EventCore>, timeout: Duration) {
        let gen = core.timer_gen.get() + 1;
        core.timer_gen.set(gen);

        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        self.timers.borrow_mut().push(TimerEntry {
            when: Instant::now() + timeout,
            seq,
            id: core.id,
            gen,
        });
    }

    pub(crate) fn activate(&self, core: &Rc<EventCore>) {
        if core.queued.get() {
            return;
        }
        core.queued.set(true);
        let p = core.priority.get().min(self.priorities - 1);
        self.active.borrow_mut()[p].push_back(core.id);
    }

    pub(crate) fn del(&self, core: &Rc<EventCore>) {
        self.del_core(core);

        // Guarantee the event does not fire after del returns.
        if core.queued.get() {
            core.queued.set(false);
            core.fired.set(EventSet::NONE);
            for q in self.active.borrow_mut().iter_mut() {
                q.retain(|&id| id != core.id);
            }
        }
    }

    fn del_core(&self, core: &Rc<EventCore>) {
        if core.armed.get() {
            core.armed.set(false);
            core.timer_gen.set(core.timer_gen.get() + 1);

            if core.is_signal_event() {
                self.signal_table.borrow_mut().remove(&core.fd);
            } else if core.is_fd_event() {
                let mut table = self.fd_table.borrow_mut();
                if let Some(slots) = table.get_mut(&core.fd) {
                    if slots.read == Some(core.id) {
                        slots.read = None;
                    }
                    if slots.write == Some(core.id) {
                        slots.write = None;
                    }
                    Self::sync_fd(&self.selector, core.fd, slots);
                    if slots.read.is_none() && slots.write.is_none() {
                        table.remove(&core.fd);
                    }
                }
            }
        }

        if core.flags.contains(EventFlags::FINALIZE) {
            core.finalized.set(true);
            if let Ok(mut cb) = core.cb.try_borrow_mut() {
                *cb = None;
            }
        }

        core.self_ref.borrow_mut().take();
    }

    pub(crate) fn set_priority(&self, core: &Rc<EventCore>, priority: usize) {
        core.priority.set(priority.min(self.priorities - 1));
    }

    fn has_active(&self) -> bool {
        self.active.borrow().iter().any(|q| !q.is_empty())
    }

    fn next_timer_delay(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut timers = self.timers.borrow_mut();

        loop {
            let stale = match timers.peek() {
                None => return None,
                Some(entry) => match self.lookup(entry.id) {
                    Some(core) => core.timer_gen.get() != entry.gen || !core.armed.get(),
                    None => true,
                },
            };

            if stale {
                timers.pop();
                continue;
            }

            let when = timers.peek().map(|e| e.when).unwrap();
            return Some(when.saturating_duration_since(now));
        }
    }

    pub(crate) fn tick(&self, block: bool) -> io::Result<()> {
        let timeout = if !block || self.has_active() {
            Some(Duration::ZERO)
        } else {
            self.next_timer_delay()
        };

        {
            let mut events = self.events.borrow_mut();
            self.selector.select(&mut events, timeout)?;

            for i in 0..events.len() {
                match events.token(i) {
                    WAKER_TOKEN => {
                        self.cross.waker.reset();
                        self.drain_cross();
                    }
                    SIGNAL_TOKEN => self.dispatch_signals(),
                    token => {
                        let (read, write) = events.readiness(i);
                        self.dispatch_fd(token as RawFd, read, write);
                    }
                }
            }
        }

        self.dispatch_timers();
        self.process_active();
        Ok(())
    }

    fn drain_cross(&self) {
        let ids = std::mem::take(
            &mut *self
                .cross
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for id in ids {
            if let Some(core) = self.lookup(id) {
                self.activate(&core);
            }
        }
    }

    fn dispatch_signals(&self) {
        let signals = match self.signal_fd.borrow().as_ref() {
            Some(sfd) => sfd.read(),
            None => return,
        };

        for signo in signals {
            let id = self.signal_table.borrow().get(&signo).copied();
            if let Some(id) = id {
                if let Some(core) = self.lookup(id) {
                    let mut fired = core.fired.get();
                    fired.insert(EventSet::SIGNAL);
                    core.fired.set(fired);
                    self.activate(&core);
                }
            }
        }
    }

    fn dispatch_fd(&self, fd: RawFd, read: bool, write: bool) {
        let (read_id, write_id) = match self.fd_table.borrow().get(&fd) {
            Some(slots) => (
                if read { slots.read } else { None },
                if write { slots.write } else { None },
            ),
            None => return,
        };

        if let Some(id) = read_id {
            self.fire_fd_slot(fd, id, EventSet::READ);
        }
        if let Some(id) = write_id {
            if write_id != read_id {
                self.fire_fd_slot(fd, id, EventSet::WRITE);
            } else if let Some(core) = self.lookup(id) {
                let mut fired = core.fired.get();
                fired.insert(EventSet::WRITE);
                core.fired.set(fired);
            }
        }
    }

    fn fire_fd_slot(&self, fd: RawFd, id: u64, what: EventSet) {
        match self.lookup(id) {
            Some(core) => {
                let mut fired = core.fired.get();
                fired.insert(what);
                core.fired.set(fired);
                self.activate(&core);
            }
            None => {
                // The owning handle is gone; retire the stale registration.
                let mut table = self.fd_table.borrow_mut();
                if let Some(slots) = table.get_mut(&fd) {
                    if slots.read == Some(id) {
                        slots.read = None;
                    }
                    if slots.write == Some(id) {
                        slots.write = None;
                    }
                    Self::sync_fd(&self.selector, fd, slots);
                    if slots.read.is_none() && slots.write.is_none() {
                        table.remove(&fd);
                    }
                }
            }
        }
    }

    fn dispatch_timers(&self) {
        let now = Instant::now();

        loop {
            let entry = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(e) if e.when <= now => timers.pop().unwrap(),
                    _ => break,
                }
            };

            if let Some(core) = self.lookup(entry.id) {
                if core.timer_gen.get() == entry.gen && core.armed.get() {
                    let mut fired = core.fired.get();
                    fired.insert(EventSet::TIMEOUT);
                    core.fired.set(fired);
                    self.activate(&core);
                }
            }
        }
    }

    /// Dispatch everything queued at tick start, highest priority first.
    ///
    /// Activations made from inside callbacks land behind the snapshot and
    /// fire on a later tick.
    fn process_active(&self) {
        let counts: Vec<usize> = self.active.borrow().iter().map(|q| q.len()).collect();

        for (p, count) in counts.into_iter().enumerate() {
            for _ in 0..count {
                if self.break_flag.get() {
                    return;
                }

                let id = match self.active.borrow_mut()[p].pop_front() {
                    Some(id) => id,
                    None => break,
                };

                if let Some(core) = self.lookup(id) {
                    if core.queued.get() {
                        self.fire(core);
                    }
                }
            }
        }
    }

    fn fire(&self, core: Rc<EventCore>) {
        core.queued.set(false);
        let what = core.fired.replace(EventSet::NONE);
        let persist = core.flags.contains(EventFlags::PERSIST);

        // Take the callback before a one-shot disarm, which may finalize it.
        let cb = core.cb.borrow_mut().take();

        if core.armed.get() {
            if !persist {
                self.del_core(&core);
            } else if what.contains(EventSet::TIMEOUT) {
                if let Some(t) = core.timeout.get() {
                    self.arm_timer(&core, t);
                }
            }
        }

        if let Some(mut cb) = cb {
            match &mut cb {
                Callback::Simple(f) => f(),
                Callback::Fd(f) => f(what),
            }
            if !core.finalized.get() && core.cb.borrow().is_none() {
                *core.cb.borrow_mut() = Some(cb);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn timer_fires_once() {
        let base = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        let b = base.clone();
        let event = base.new_event(
            move || {
                f.set(f.get() + 1);
                b.break_loop();
            },
            EventFlags::NONE,
        );
        event.add_timeout(Duration::from_millis(1));

        base.run().unwrap();
        assert_eq!(fired.get(), 1);
        assert!(!event.is_pending());
    }

    #[test]
    fn priority_order_within_tick() {
        let base = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut events = Vec::new();
        for (name, priority) in [("low", 3), ("high", 0), ("mid", 1)] {
            let o = order.clone();
            let event = base.new_event(move || o.borrow_mut().push(name), EventFlags::NONE);
            event.set_priority(priority);
            event.activate();
            events.push(event);
        }

        base.run_nonblock().unwrap();
        assert_eq!(*order.borrow(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn activate_is_not_recursive() {
        let base = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));

        let event: Rc<RefCell<Option<Event>>> = Rc::new(RefCell::new(None));

        let c = count.clone();
        let e2 = event.clone();
        let ev = base.new_event(
            move || {
                c.set(c.get() + 1);
                if c.get() == 1 {
                    // Queued for a later tick, not run recursively.
                    e2.borrow().as_ref().unwrap().activate();
                    assert_eq!(c.get(), 1);
                }
            },
            EventFlags::NONE,
        );
        *event.borrow_mut() = Some(ev.clone());

        ev.activate();
        base.run_nonblock().unwrap();
        assert_eq!(count.get(), 1);
        base.run_nonblock().unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn del_prevents_fire() {
        let base = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let event = base.new_event(move || f.set(true), EventFlags::NONE);
        event.activate();
        event.del();

        base.run_nonblock().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn persistent_timer_rearms() {
        let base = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0));

        let c = count.clone();
        let b = base.clone();
        let event = base.new_event(
            move || {
                c.set(c.get() + 1);
                if 3 <= c.get() {
                    b.break_loop();
                }
            },
            EventFlags::PERSIST,
        );
        event.add_timeout(Duration::from_millis(1));

        base.run().unwrap();
        assert_eq!(count.get(), 3);
        assert!(event.is_pending());
    }
}
