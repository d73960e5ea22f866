use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::buffer::Buffer;
use crate::error::Error;
use crate::event::{Event, EventFlags, EventSet};
use crate::event_loop::EventLoop;
use crate::fd::Fd;
use crate::http::conn::{read_chunks, ConnCore, HttpConn};
use crate::http::request::{ConnRef, Request};
use crate::http::{status, Method, ServerOptions, Version};
use crate::net::socket::{flags, Socket};
use crate::net::tls::TlsEngine;
use crate::net::{AddressFilter, SockAddr};
use crate::sys;

type Handler = Box<dyn Fn(&Rc<Request>) -> crate::Result<()>>;
type ExpectHandler = Box<dyn Fn(&Rc<Request>) -> bool>;

const BACKOFF_MIN: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(16);

/// An HTTP/1.1 server: listening ports, an accept loop with backoff, and
/// dispatch of parsed requests to one handler.
///
/// The handler answers by calling [`Request::reply`] (immediately or from a
/// later callback). A handler error is translated into an error response.
///
/// [`Request::reply`]: crate::http::Request::reply
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

pub(crate) struct ServerInner {
    weak: RefCell<Weak<ServerInner>>,
    base: EventLoop,
    handler: Handler,
    expect_handler: RefCell<Option<ExpectHandler>>,
    filter: AddressFilter,
    ports: RefCell<Vec<Rc<Port>>>,
    connections: RefCell<HashMap<u64, Rc<ConnIn>>>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
    max_connections: Cell<usize>,
    max_ttl: Cell<Option<Duration>>,
    backlog: Cell<i32>,
    max_header_size: Cell<usize>,
    max_body_size: Cell<usize>,
    tls: RefCell<Option<Arc<rustls::ServerConfig>>>,
}

impl Server {
    pub fn new<F>(base: &EventLoop, handler: F) -> Server
    where
        F: Fn(&Rc<Request>) -> crate::Result<()> + 'static,
    {
        let inner = Rc::new(ServerInner {
                weak: RefCell::new(Weak::new()),
                base: base.clone(),
                handler: Box::new(handler),
                expect_handler: RefCell::new(None),
                filter: AddressFilter::new(Some(base.dns())),
                ports: RefCell::new(Vec::new()),
                connections: RefCell::new(HashMap::new()),
                read_timeout: Cell::new(None),
                write_timeout: Cell::new(None),
                max_connections: Cell::new(usize::MAX),
                max_ttl: Cell::new(None),
                backlog: Cell::new(128),
                max_header_size: Cell::new(0),
                max_body_size: Cell::new(0),
                tls: RefCell::new(None),
        });
        *inner.weak.borrow_mut() = Rc::downgrade(&inner);
        Server { inner }
    }

    pub fn allow(&self, spec: &str) {
        self.inner.filter.allow(spec);
    }

    pub fn deny(&self, spec: &str) {
        self.inner.filter.deny(spec);
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.read_timeout.set(timeout);
        self.inner.write_timeout.set(timeout);
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.read_timeout.set(timeout);
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.write_timeout.set(timeout);
    }

    pub fn set_max_connections(&self, max: usize) {
        self.inner.max_connections.set(if max == 0 { usize::MAX } else { max });
    }

    pub fn set_max_ttl(&self, ttl: Option<Duration>) {
        self.inner.max_ttl.set(ttl);
    }

    pub fn set_backlog(&self, backlog: i32) {
        self.inner.backlog.set(backlog);
    }

    pub fn set_max_header_size(&self, max: usize) {
        self.inner.max_header_size.set(max);
    }

    pub fn set_max_body_size(&self, max: usize) {
        self.inner.max_body_size.set(max);
    }

    /// TLS configuration used by subsequent [`bind_tls`] calls.
    ///
    /// [`bind_tls`]: Server::bind_tls
    pub fn set_tls_config(&self, config: Arc<rustls::ServerConfig>) {
        *self.inner.tls.borrow_mut() = Some(config);
    }

    /// Hook deciding whether `Expect: 100-continue` requests may proceed;
    /// rejected requests get `417 Expectation Failed`.
    pub fn set_expect_handler<F>(&self, handler: F)
    where
        F: Fn(&Rc<Request>) -> bool + 'static,
    {
        *self.inner.expect_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Apply configuration values; see [`ServerOptions`].
    pub fn apply_options(&self, options: &ServerOptions) -> crate::Result<Vec<SockAddr>> {
        self.allow(&options.allow);
        self.deny(&options.deny);

        if let Some(secs) = options.connection_timeout {
            self.set_timeout(Some(Duration::from_secs(secs)));
        }
        self.set_backlog(options.connection_backlog);
        if let Some(max) = options.max_connections {
            self.set_max_connections(max);
        }
        self.set_max_ttl(options.max_ttl.map(Duration::from_secs));
        if let Some(max) = options.http_max_headers_size {
            self.set_max_header_size(max);
        }
        if let Some(max) = options.http_max_body_size {
            self.set_max_body_size(max);
        }

        let mut bound = Vec::new();
        for spec in options.http_addresses.split_whitespace() {
            bound.push(self.bind(&parse_bind_addr(spec, 80)?)?);
        }
        for spec in options.https_addresses.split_whitespace() {
            bound.push(self.bind_tls_configured(&parse_bind_addr(spec, 443)?)?);
        }
        Ok(bound)
    }

    /// Listen for plain HTTP on `addr`, returning the bound address.
    pub fn bind(&self, addr: &SockAddr) -> crate::Result<SockAddr> {
        self.inner.clone().bind_port(addr, None)
    }

    /// Listen for HTTPS on `addr` with an explicit TLS configuration.
    pub fn bind_tls(
        &self,
        addr: &SockAddr,
        config: Arc<rustls::ServerConfig>,
    ) -> crate::Result<SockAddr> {
        self.inner.clone().bind_port(addr, Some(config))
    }

    fn bind_tls_configured(&self, addr: &SockAddr) -> crate::Result<SockAddr> {
        let config = self
            .inner
            .tls
            .borrow()
            .clone()
            .ok_or_else(|| Error::Connect("no TLS configuration set".into()))?;
        self.bind_tls(addr, config)
    }

    /// Stop accepting and drop all listening ports.
    pub fn shutdown(&self) {
        for port in self.inner.ports.borrow_mut().drain(..) {
            port.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.borrow().len()
    }
}

fn parse_bind_addr(spec: &str, default_port: u16) -> crate::Result<SockAddr> {
    let addr = SockAddr::parse(spec)?;
    Ok(if addr.port() == 0 {
        addr.with_port(default_port)
    } else {
        addr
    })
}

impl ServerInner {
    fn bind_port(
        self: Rc<Self>,
        addr: &SockAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> crate::Result<SockAddr> {
        debug!("binding {}{}", if tls.is_some() { "tls " } else { "" }, addr);

        let port = Port::new(&self, *addr, tls);
        let bound = port.open()?;
        self.ports.borrow_mut().push(port);
        Ok(bound)
    }

    fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Admit one accepted socket: filter, wrap, start reading.
    fn accept(
        &self,
        peer: SockAddr,
        socket: Socket,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) {
        if !self.filter.is_allowed(&peer) {
            debug!("denying connection from {}", peer);
            return;
        }

        debug!("new connection from {}", peer);

        let raw = socket.into_raw();
        let engine = match tls {
            Some(config) => match TlsEngine::server(config, raw) {
                Ok(engine) => Some(Arc::new(Mutex::new(engine))),
                Err(e) => {
                    warn!("TLS setup failed: {}", e);
                    sys::close(raw);
                    return;
                }
            },
            None => None,
        };

        let fd = match Fd::new(&self.base, raw, engine) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("failed to register fd: {}", e);
                sys::close(raw);
                return;
            }
        };
        fd.set_read_timeout(self.read_timeout.get());
        fd.set_write_timeout(self.write_timeout.get());

        let conn = ConnIn::new(self, fd, peer);

        if let Some(ttl) = self.max_ttl.get() {
            let weak = Rc::downgrade(&conn);
            let event = self.base.new_event(
                move || {
                    if let Some(conn) = weak.upgrade() {
                        debug!("CON{}: TTL expired", conn.core.id);
                        conn.close();
                    }
                },
                EventFlags::NONE,
            );
            event.add_timeout(ttl);
            *conn.core.ttl_event.borrow_mut() = Some(event);
        }

        self.connections.borrow_mut().insert(conn.core.id, conn.clone());
        conn.read_header();
    }

    fn remove(&self, id: u64) {
        if self.connections.borrow_mut().remove(&id).is_some() {
            debug!("CON{}: connection ended", id);
            for port in self.ports.borrow().iter() {
                port.activate();
            }
        }
    }

    fn continue_allowed(&self, req: &Rc<Request>) -> bool {
        match self.expect_handler.borrow().as_ref() {
            Some(handler) => handler(req),
            None => true,
        }
    }

    fn dispatch(&self, req: &Rc<Request>) {
        if let Err(e) = (self.handler)(req) {
            let code = match &e {
                Error::Protocol(_) => status::BAD_REQUEST,
                Error::Limit(_) => status::PAYLOAD_TOO_LARGE,
                Error::Timeout => status::REQUEST_TIMEOUT,
                _ => status::INTERNAL_SERVER_ERROR,
            };
            warn!("REQ{}: handler failed: {}", req.id(), e);
            if !req.is_finalized() {
                req.send_error(code, &e.to_string());
            }
        }
    }
}

/// One listening socket with its accept event and error backoff.
struct Port {
    weak: RefCell<Weak<Port>>,
    server: Weak<ServerInner>,
    addr: SockAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    socket: RefCell<Option<Socket>>,
    event: RefCell<Option<Event>>,
    backoff: Cell<Duration>,
}

impl Port {
    fn new(
        server: &Rc<ServerInner>,
        addr: SockAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Rc<Port> {
        let port = Rc::new(Port {
            weak: RefCell::new(Weak::new()),
            server: Rc::downgrade(server),
            addr,
            tls,
            socket: RefCell::new(None),
            event: RefCell::new(None),
            backoff: Cell::new(Duration::ZERO),
        });
        *port.weak.borrow_mut() = Rc::downgrade(&port);
        port
    }

    fn open(&self) -> crate::Result<SockAddr> {
        let server = self.server.upgrade().expect("server gone");

        let socket = Socket::open(
            flags::NONBLOCKING | flags::CLOEXEC | flags::REUSEADDR,
            Some(&self.addr),
        )?;
        socket.listen(server.backlog.get())?;
        let bound = socket.local_addr()?;

        *self.socket.borrow_mut() = Some(socket);
        self.add_event(None);
        Ok(bound)
    }

    fn close(&self) {
        if let Some(event) = self.event.borrow_mut().take() {
            event.del();
        }
        self.socket.borrow_mut().take();
    }

    /// Re-arm accepting, e.g. after a connection slot frees up.
    fn activate(&self) {
        if let Some(event) = self.event.borrow().as_ref() {
            if !event.is_pending() {
                event.add();
            }
        }
    }

    fn accept_ready(&self) {
        let server = match self.server.upgrade() {
            Some(server) => server,
            None => return,
        };

        loop {
            if server.max_connections.get() <= server.connection_count() {
                if let Some(event) = self.event.borrow().as_ref() {
                    event.del();
                }
                return;
            }

            let accepted = match self.socket.borrow().as_ref() {
                Some(socket) => socket.accept(),
                None => return,
            };

            match accepted {
                Ok(Some((socket, peer))) => {
                    self.backoff.set(Duration::ZERO);
                    server.accept(peer, socket, self.tls.clone());
                }
                Ok(None) => return,
                Err(e) => {
                    // Back off instead of spinning on errors like EMFILE.
                    warn!("accept on {} failed: {}", self.addr, e);
                    let delay = self.next_backoff();
                    return self.add_event(Some(delay));
                }
            }
        }
    }

    fn next_backoff(&self) -> Duration {
        let next = (self.backoff.get() * 2).clamp(BACKOFF_MIN, BACKOFF_MAX);
        self.backoff.set(next);
        next
    }

    fn add_event(&self, delay: Option<Duration>) {
        let server = match self.server.upgrade() {
            Some(server) => server,
            None => return,
        };

        if let Some(event) = self.event.borrow_mut().take() {
            event.del();
        }

        let event = match delay {
            Some(delay) => {
                let weak = self.weak.borrow().clone();
                let event = server.base.new_event(
                    move || {
                        if let Some(port) = weak.upgrade() {
                            port.add_event(None);
                        }
                    },
                    EventFlags::NONE,
                );
                event.add_timeout(delay);
                event
            }
            None => {
                let fd = match self.socket.borrow().as_ref() {
                    Some(socket) => socket.raw(),
                    None => return,
                };
                let weak = self.weak.borrow().clone();
                let event = server.base.new_fd_event(
                    fd,
                    EventSet::READ,
                    EventFlags::PERSIST,
                    move |_| {
                        if let Some(port) = weak.upgrade() {
                            port.accept_ready();
                        }
                    },
                );
                event.add();
                event
            }
        };

        *self.event.borrow_mut() = Some(event);
    }
}

/// Server side of one HTTP connection.
pub struct ConnIn {
    pub(crate) core: ConnCore,
    server: Weak<ServerInner>,
    weak: RefCell<Weak<ConnIn>>,
}

impl HttpConn for ConnIn {
    fn core(&self) -> &ConnCore {
        &self.core
    }

    fn shutdown(self: Rc<Self>) {
        self.close();
    }
}

impl ConnIn {
    fn new(server: &ServerInner, fd: Fd, peer: SockAddr) -> Rc<ConnIn> {
        let core = ConnCore::new(&server.base);
        core.set_fd(fd);
        *core.peer.borrow_mut() = peer;
        core.max_header_size.set(server.max_header_size.get());
        core.max_body_size.set(server.max_body_size.get());

        let conn = Rc::new(ConnIn {
            core,
            server: server.weak.borrow().clone(),
            weak: RefCell::new(Weak::new()),
        });
        *conn.weak.borrow_mut() = Rc::downgrade(&conn);
        conn
    }

    fn strong(&self) -> Rc<ConnIn> {
        self.weak.borrow().upgrade().expect("connection dropped")
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn peer(&self) -> SockAddr {
        *self.core.peer.borrow()
    }

    fn read_header(&self) {
        trace!("CON{}: reading request header", self.core.id);

        let max_header = self.core.max_header_size.get();
        let conn = self.strong();
        self.core
            .read(&self.core.input.clone(), max_header, Some(b"\r\n\r\n"), move |success| {
                if !success {
                    return conn.close();
                }

                match conn.core.input.index_of(b"\r\n\r\n") {
                    Some(i) if max_header == 0 || i + 4 <= max_header => conn.process_header(),
                    _ => conn.error(status::BAD_REQUEST, "Header too large"),
                }
            });
    }

    fn process_header(&self) {
        let max_header = self.core.max_header_size.get();

        // Request line: METHOD SP target SP HTTP/M.m
        let line = match self.core.input.read_line(max_header, b"\r\n") {
            Ok(Some(line)) => line,
            _ => return self.error(status::BAD_REQUEST, "Missing request line"),
        };

        let mut parts = line.split(' ').filter(|p| !p.is_empty());
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(t), Some(v), None) => (m, t, v),
            _ => return self.error(status::BAD_REQUEST, "Invalid request line"),
        };

        let method: Method = method.parse().unwrap_or(Method::Unknown);
        let version = match Version::parse(version) {
            Ok(version) => version,
            Err(_) => return self.error(status::BAD_REQUEST, "Invalid HTTP version"),
        };

        let req = Request::new(method, target, version);
        req.set_conn(ConnRef::In(self.weak.borrow().clone()));
        req.set_client_addr(*self.core.peer.borrow());

        match req.input_headers_mut().parse(&self.core.input, max_header) {
            Ok(true) => {}
            _ => return self.error(status::BAD_REQUEST, "Incomplete headers"),
        }

        if !req.may_have_body() {
            return self.add_request(req);
        }

        // Expect: 100-continue
        if Version::V1_1 <= version {
            if let Some(expect) = req.in_get("Expect") {
                let server = self.server.upgrade();
                let allowed = expect.eq_ignore_ascii_case("100-continue")
                    && server.map_or(true, |s| s.continue_allowed(&req));

                if !allowed {
                    return self.error(status::EXPECTATION_FAILED, "Cannot continue");
                }

                let line = Buffer::from_bytes(
                    format!("{} 100 Continue\r\n\r\n", version).as_bytes(),
                );
                let conn = self.strong();
                return self.core.write(&line, move |success| {
                    if success {
                        conn.check_chunked(req);
                    } else {
                        conn.error(status::BAD_REQUEST, "Failed to send continue");
                    }
                });
            }
        }

        self.check_chunked(req);
    }

    fn check_chunked(&self, req: Rc<Request>) {
        let chunked = req
            .in_get("Transfer-Encoding")
            .map_or(false, |te| te.trim().eq_ignore_ascii_case("chunked"));

        if chunked {
            let conn = self.strong();
            let req2 = req.clone();
            return read_chunks(
                self.strong(),
                req,
                Box::new(move |success| {
                    if success {
                        conn.add_request(req2);
                    } else {
                        debug!("CON{}: incomplete chunked request body", conn.core.id);
                        conn.close();
                    }
                }),
            );
        }

        let content_length = match req.in_get("Content-Length") {
            None => 0,
            Some(s) => match s.trim().parse::<usize>() {
                Ok(n) => n,
                Err(_) => return self.error(status::BAD_REQUEST, "Invalid Content-Length"),
            },
        };

        if content_length == 0 {
            return self.add_request(req);
        }

        let max_body = self.core.max_body_size.get();
        if max_body != 0 && max_body < content_length {
            return self.error(status::PAYLOAD_TOO_LARGE, "Body too large");
        }

        let buffered = self.core.input.len();
        if buffered < content_length {
            self.core.input.expand(content_length - buffered);
        }

        let conn = self.strong();
        self.core
            .read(&self.core.input.clone(), content_length, None, move |_| {
                if conn.core.input.len() < content_length {
                    debug!(
                        "CON{}: incomplete request body, {} of {} bytes",
                        conn.core.id,
                        conn.core.input.len(),
                        content_length
                    );
                    return conn.close();
                }

                if conn
                    .core
                    .input
                    .remove_buffer(&req.input_buffer(), content_length)
                    .is_err()
                {
                    return conn.close();
                }
                conn.add_request(req);
            });
    }

    fn add_request(&self, req: Rc<Request>) {
        self.core.push_request(req.clone());
        if self.core.num_requests() == 1 {
            self.process_request(&req);
        }
    }

    fn process_request(&self, req: &Rc<Request>) {
        info!("< {} {}", self.core.peer.borrow(), req.request_line());

        if let Some(server) = self.server.upgrade() {
            server.dispatch(req);
        }
    }

    /// Write a marshalled response for the pipeline head.
    pub(crate) fn write_request(&self, req: &Rc<Request>, buffer: Buffer, has_more: bool) {
        trace!(
            "CON{}: writing response, length={} has_more={}",
            self.core.id,
            buffer.len(),
            has_more
        );

        if !self.core.check_active(req) {
            return;
        }

        let conn = self.strong();
        let req = req.clone();
        self.core.write(&buffer, move |success| {
            trace!(
                "CON{}: response {}",
                conn.core.id,
                if success { "sent" } else { "failed" }
            );

            if !success {
                return conn.close();
            }
            if has_more {
                return;
            }

            conn.core.pop_request();

            // An upgraded connection belongs to its new protocol now.
            if req.is_upgraded() {
                return;
            }

            if !req.is_persistent() {
                return conn.close();
            }

            match conn.core.front_request() {
                Some(next) => conn.process_request(&next),
                None => conn.read_header(),
            }
        });
    }

    /// Fail the exchange: answer the active request if one exists, else
    /// write a bare error response and close.
    fn error(&self, code: u16, message: &str) {
        debug!("CON{}: error {}: {}", self.core.id, code, message);

        if let Some(req) = self.core.front_request() {
            if !req.is_finalized() {
                return req.send_error(code, message);
            }
        }

        let body = message.as_bytes();
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            code,
            status::reason(code),
            body.len(),
        );
        let buffer = Buffer::from_bytes(head.as_bytes());
        let _ = buffer.add(body);

        let conn = self.strong();
        self.core.write(&buffer, move |_| conn.close());
    }

    pub(crate) fn close(&self) {
        // Keep the connection alive through teardown.
        let conn = self.strong();

        conn.core.close_fd();
        while conn.core.pop_request().is_some() {}

        if let Some(server) = conn.server.upgrade() {
            server.remove(conn.core.id);
        }
    }
}
