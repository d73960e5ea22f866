use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::trace;

use crate::error::Error;
use crate::event::{Event, EventFlags};
use crate::event_loop::EventLoop;
use crate::net::SockAddr;

type DnsCallback = Box<dyn FnOnce(crate::Result<Vec<SockAddr>>)>;

struct Job {
    id: u64,
    name: String,
    cancelled: Arc<AtomicBool>,
}

type DnsOutcome = std::result::Result<Vec<SockAddr>, String>;

/// Asynchronous name resolution for the event loop.
///
/// Lookups run on a helper thread; callbacks fire on the loop thread.
/// Resolver internals are deliberately simple. The contract that matters is
/// the cancelable handle and loop-side delivery.
pub struct Dns {
    weak: RefCell<std::rc::Weak<Dns>>,
    jobs: mpsc::Sender<Job>,
    pending: RefCell<HashMap<u64, DnsCallback>>,
    results: Arc<Mutex<Vec<(u64, DnsOutcome)>>>,
    event: RefCell<Option<Event>>,
    next_id: Cell<u64>,
    worker: RefCell<Option<JoinHandle<()>>>,
}

/// Handle to one in-flight lookup.
pub struct DnsRequest {
    id: u64,
    cancelled: Arc<AtomicBool>,
    dns: std::rc::Weak<Dns>,
}

impl DnsRequest {
    /// Cancel the lookup; the callback will not run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Some(dns) = self.dns.upgrade() {
            dns.pending.borrow_mut().remove(&self.id);
        }
    }
}

impl Dns {
    pub(crate) fn new(base: &EventLoop) -> Rc<Dns> {
        let (tx, rx) = mpsc::channel::<Job>();

        let dns = Rc::new(Dns {
            weak: RefCell::new(std::rc::Weak::new()),
            jobs: tx,
            pending: RefCell::new(HashMap::new()),
            results: Arc::new(Mutex::new(Vec::new())),
            event: RefCell::new(None),
            next_id: Cell::new(0),
            worker: RefCell::new(None),
        });

        let weak = Rc::downgrade(&dns);
        let event = base.new_event(
            move || {
                if let Some(dns) = weak.upgrade() {
                    dns.deliver();
                }
            },
            EventFlags::PERSIST,
        );
        event.add();
        let notify = event.activator();
        *dns.event.borrow_mut() = Some(event);

        let results = dns.results.clone();
        let worker = thread::Builder::new()
            .name("evio-dns".into())
            .spawn(move || {
                for job in rx {
                    if job.cancelled.load(Ordering::Relaxed) {
                        continue;
                    }

                    trace!("resolving '{}'", job.name);
                    let outcome = match (job.name.as_str(), 0u16).to_socket_addrs() {
                        Ok(addrs) => Ok(addrs.map(SockAddr::from).collect::<Vec<_>>()),
                        Err(e) => Err(e.to_string()),
                    };

                    results
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((job.id, outcome));
                    notify.activate();
                }
            })
            .expect("failed to start DNS thread");
        *dns.worker.borrow_mut() = Some(worker);
        *dns.weak.borrow_mut() = Rc::downgrade(&dns);

        dns
    }

    /// Resolve `name` to its addresses, invoking `cb` on the loop thread.
    pub fn resolve<F>(&self, name: &str, cb: F) -> DnsRequest
    where
        F: FnOnce(crate::Result<Vec<SockAddr>>) + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.borrow_mut().insert(id, Box::new(cb));

        let job = Job {
            id,
            name: name.to_string(),
            cancelled: cancelled.clone(),
        };
        if self.jobs.send(job).is_err() {
            // Resolver thread gone; fail the request on the next tick.
            self.results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((id, Err("resolver unavailable".into())));
            if let Some(event) = self.event.borrow().as_ref() {
                event.activate();
            }
        }

        DnsRequest {
            id,
            cancelled,
            dns: self.weak.borrow().clone(),
        }
    }

    fn deliver(&self) {
        let results = std::mem::take(
            &mut *self.results.lock().unwrap_or_else(|e| e.into_inner()),
        );

        for (id, outcome) in results {
            let cb = self.pending.borrow_mut().remove(&id);
            if let Some(cb) = cb {
                cb(outcome.map_err(Error::Connect));
            }
        }
    }
}

impl Drop for Dns {
    fn drop(&mut self) {
        // Closing the channel stops the worker at its next recv.
        if let Some(worker) = self.worker.borrow_mut().take() {
            drop(std::mem::replace(&mut self.jobs, mpsc::channel().0));
            let _ = worker.join();
        }
    }
}
