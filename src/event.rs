use std::cell::{Cell, RefCell};
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event_loop::Inner;
use crate::sys;

/// What an event waits for, and what it fired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(1 << 0);
    pub const WRITE: EventSet = EventSet(1 << 1);
    pub const CLOSE: EventSet = EventSet(1 << 2);
    pub const TIMEOUT: EventSet = EventSet(1 << 3);
    pub const SIGNAL: EventSet = EventSet(1 << 4);
    pub const EDGE_TRIG: EventSet = EventSet(1 << 5);

    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn insert(&mut self, other: EventSet) {
        self.0 |= other.0;
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

/// Behavior flags given to [`EventLoop::new_event`].
///
/// [`EventLoop::new_event`]: crate::EventLoop::new_event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    /// Re-arm automatically after each fire instead of firing once.
    pub const PERSIST: EventFlags = EventFlags(1 << 0);
    /// The armed event does not keep its own callback alive; dropping the
    /// last `Event` handle cancels it.
    pub const NO_SELF_REF: EventFlags = EventFlags(1 << 1);
    /// Drop the callback (releasing anything it captured) when the event is
    /// deleted.
    pub const FINALIZE: EventFlags = EventFlags(1 << 2);

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

pub(crate) enum Callback {
    Simple(Box<dyn FnMut()>),
    Fd(Box<dyn FnMut(EventSet)>),
}

pub(crate) struct EventCore {
    pub id: u64,
    pub flags: EventFlags,
    /// Target fd for READ/WRITE events, signal number for SIGNAL events,
    /// -1 for pure timers and activations.
    pub fd: RawFd,
    pub interest: EventSet,
    pub priority: Cell<usize>,
    pub cb: RefCell<Option<Callback>>,
    pub armed: Cell<bool>,
    pub queued: Cell<bool>,
    pub fired: Cell<EventSet>,
    pub timeout: Cell<Option<Duration>>,
    pub timer_gen: Cell<u64>,
    /// Set once the event has been deleted with FINALIZE; the callback is
    /// never restored after this.
    pub finalized: Cell<bool>,
    /// Keeps the event alive while armed, unless NO_SELF_REF.
    pub self_ref: RefCell<Option<Rc<EventCore>>>,
}

impl EventCore {
    pub fn is_fd_event(&self) -> bool {
        self.fd >= 0 && self.interest.intersects(EventSet::READ | EventSet::WRITE)
    }

    pub fn is_signal_event(&self) -> bool {
        self.interest.contains(EventSet::SIGNAL)
    }
}

/// Handle to an event registered with an [`EventLoop`].
///
/// Dropping the handle does not cancel an armed event unless it was created
/// with [`EventFlags::NO_SELF_REF`].
///
/// [`EventLoop`]: crate::EventLoop
#[derive(Clone)]
pub struct Event {
    pub(crate) core: Rc<EventCore>,
    pub(crate) inner: Weak<Inner>,
}

impl Event {
    /// Arm the event with no timeout.
    pub fn add(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.arm(&self.core, None);
        }
    }

    /// Arm the event; it fires with `TIMEOUT` after `timeout` unless its fd
    /// or signal condition fires first.
    pub fn add_timeout(&self, timeout: Duration) {
        if let Some(inner) = self.inner.upgrade() {
            inner.arm(&self.core, Some(timeout));
        }
    }

    /// Queue the event for dispatch in a later loop tick.
    ///
    /// Never recursive: activating from inside a callback fires on a
    /// subsequent tick.
    pub fn activate(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.activate(&self.core);
        }
    }

    /// Disarm the event. It will not fire after this returns.
    pub fn del(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.del(&self.core);
        }
    }

    /// True while the event is armed or queued for dispatch.
    pub fn is_pending(&self) -> bool {
        self.core.armed.get() || self.core.queued.get()
    }

    /// Set the dispatch priority, 0 being highest.
    pub fn set_priority(&self, priority: usize) {
        if let Some(inner) = self.inner.upgrade() {
            inner.set_priority(&self.core, priority);
        } else {
            self.core.priority.set(priority);
        }
    }

    pub fn priority(&self) -> usize {
        self.core.priority.get()
    }

    /// A `Send` handle that can activate this event from any thread.
    pub fn activator(&self) -> Activator {
        let inner = self.inner.upgrade().expect("event loop gone");
        Activator {
            id: self.core.id,
            cross: inner.cross.clone(),
        }
    }
}

/// Cross-thread activation queue shared between the loop and its wakers.
pub(crate) struct CrossState {
    pub pending: Mutex<Vec<u64>>,
    pub waker: sys::Waker,
}

/// Thread-safe handle that queues an event activation and wakes the loop.
#[derive(Clone)]
pub struct Activator {
    id: u64,
    cross: Arc<CrossState>,
}

impl Activator {
    pub fn activate(&self) {
        self.cross
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.id);
        let _ = self.cross.waker.wake();
    }
}
