use std::cell::{Cell, RefCell};
use std::env;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use url::Url;

use crate::buffer::Buffer;
use crate::dns::DnsRequest;
use crate::error::{ConnectionError, Error};
use crate::event_loop::EventLoop;
use crate::fd::Fd;
use crate::http::conn::{read_chunks, ConnCore, HttpConn};
use crate::http::request::{ConnRef, Request};
use crate::http::{status, Method, Version};
use crate::net::socket::{self, flags, Socket};
use crate::net::tls::TlsEngine;
use crate::net::SockAddr;

/// Dispatches outgoing HTTP requests.
///
/// Each request gets (or reuses) an outgoing connection; the response is
/// parsed and the request's callback fires exactly once with a final
/// [`ConnectionError`] disposition.
pub struct Client {
    base: EventLoop,
    tls: RefCell<Option<Arc<rustls::ClientConfig>>>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
    max_header_size: Cell<usize>,
    max_body_size: Cell<usize>,
}

impl Client {
    pub fn new(base: &EventLoop) -> Client {
        Client {
            base: base.clone(),
            tls: RefCell::new(None),
            read_timeout: Cell::new(None),
            write_timeout: Cell::new(None),
            max_header_size: Cell::new(0),
            max_body_size: Cell::new(0),
        }
    }

    /// TLS configuration for `https` targets; without one, an `https`
    /// request fails synchronously.
    pub fn set_tls_config(&self, config: Arc<rustls::ClientConfig>) {
        *self.tls.borrow_mut() = Some(config);
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.read_timeout.set(timeout);
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.write_timeout.set(timeout);
    }

    pub fn set_max_header_size(&self, max: usize) {
        self.max_header_size.set(max);
    }

    pub fn set_max_body_size(&self, max: usize) {
        self.max_body_size.set(max);
    }

    /// Build and send one request. `cb` fires with the final disposition.
    pub fn call<F>(
        &self,
        url: &str,
        method: Method,
        body: Option<&[u8]>,
        cb: F,
    ) -> crate::Result<Rc<Request>>
    where
        F: FnOnce(&Rc<Request>, ConnectionError) + 'static,
    {
        let url = Url::parse(url).map_err(|e| Error::Connect(format!("invalid URL: {}", e)))?;
        let req = Request::with_url(method, url, Version::V1_1);
        req.set_response_callback(Box::new(cb));

        if let Some(body) = body {
            req.output_buffer().add(body)?;
        }

        self.send(&req)?;
        Ok(req)
    }

    /// Send a prepared request, connecting (possibly via a proxy) as
    /// needed.
    pub fn send(&self, req: &Rc<Request>) -> crate::Result<Rc<ConnOut>> {
        let url = req
            .url()
            .ok_or_else(|| Error::Connect("request has no URL".into()))?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(Error::Connect(format!("unsupported scheme '{}'", scheme)));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::Connect("URL has no host".into()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Connect("URL has no port".into()))?;

        let conn = match req.conn_out() {
            Some(conn) => conn,
            None => {
                let conn = ConnOut::new(&self.base);
                conn.core.max_header_size.set(self.max_header_size.get());
                conn.core.max_body_size.set(self.max_body_size.get());
                conn
            }
        };
        conn.read_timeout.set(self.read_timeout.get());
        conn.write_timeout.set(self.write_timeout.get());

        // Reuse a live connection: just queue onto its pipeline.
        if conn.is_connected() {
            let idle = conn.core.num_requests() == 0;
            conn.queue_request(req);
            if idle {
                conn.dispatch();
            }
            return Ok(conn);
        }

        let tls = if scheme == "https" {
            Some(
                self.tls
                    .borrow()
                    .clone()
                    .ok_or_else(|| Error::Connect("client lacks a TLS configuration".into()))?,
            )
        } else {
            None
        };

        let (connect_host, connect_port) = match proxy_for(&scheme, &host) {
            Some(proxy) => {
                if proxy.scheme() != "http" {
                    return Err(Error::Connect(format!(
                        "proxy scheme '{}' not supported",
                        proxy.scheme()
                    )));
                }

                let proxy_host = proxy
                    .host_str()
                    .ok_or_else(|| Error::Connect("proxy URL has no host".into()))?
                    .to_string();
                let proxy_port = proxy.port_or_known_default().unwrap_or(80);

                if let Some(config) = &tls {
                    // Tunnel TLS through the proxy with CONNECT.
                    conn.queue_connect_request(&host, port, config.clone());
                } else {
                    // Plain targets are rewritten to absolute form.
                    req.set_absolute_form();
                }
                (proxy_host, proxy_port)
            }
            None => {
                if let Some(config) = &tls {
                    conn.set_tls_plan(config.clone(), &host);
                }
                (host, port)
            }
        };

        conn.queue_request(req);
        conn.connect(&connect_host, connect_port);
        Ok(conn)
    }
}

/// The configured proxy for a target, if any.
fn proxy_for(scheme: &str, host: &str) -> Option<Url> {
    let no_proxy = env::var("no_proxy")
        .or_else(|_| env::var("NO_PROXY"))
        .unwrap_or_default();
    let exempt = no_proxy.split(',').any(|token| {
        let token = token.trim();
        !token.is_empty() && (host == token || host.ends_with(&format!(".{}", token)))
    });
    if exempt {
        return None;
    }

    let proxy = if scheme == "https" {
        env::var("https_proxy").or_else(|_| env::var("HTTPS_PROXY"))
    } else {
        env::var("http_proxy").or_else(|_| env::var("HTTP_PROXY"))
    };

    proxy.ok().and_then(|p| Url::parse(&p).ok())
}

/// Client side of one HTTP connection: connect, write the pipeline head,
/// parse responses in order.
pub struct ConnOut {
    pub(crate) core: ConnCore,
    weak: RefCell<Weak<ConnOut>>,
    tls_plan: RefCell<Option<(Arc<rustls::ClientConfig>, String)>>,
    connected: Cell<bool>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
    dns: RefCell<Option<DnsRequest>>,
}

impl HttpConn for ConnOut {
    fn core(&self) -> &ConnCore {
        &self.core
    }

    fn shutdown(self: Rc<Self>) {
        self.close();
    }
}

impl ConnOut {
    pub(crate) fn new(base: &EventLoop) -> Rc<ConnOut> {
        let conn = Rc::new(ConnOut {
            core: ConnCore::new(base),
            weak: RefCell::new(Weak::new()),
            tls_plan: RefCell::new(None),
            connected: Cell::new(false),
            read_timeout: Cell::new(None),
            write_timeout: Cell::new(None),
            dns: RefCell::new(None),
        });
        *conn.weak.borrow_mut() = Rc::downgrade(&conn);
        conn
    }

    fn strong(&self) -> Rc<ConnOut> {
        self.weak.borrow().upgrade().expect("connection dropped")
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get() && self.core.is_connected()
    }

    fn queue_request(&self, req: &Rc<Request>) {
        req.set_conn(ConnRef::Out(self.weak.borrow().clone()));
        self.core.push_request(req.clone());
    }

    fn set_tls_plan(&self, config: Arc<rustls::ClientConfig>, host: &str) {
        *self.tls_plan.borrow_mut() = Some((config, host.to_string()));
    }

    /// Queue the proxy `CONNECT` exchange ahead of the real request; on a
    /// 2xx answer the connection switches to TLS toward the target.
    fn queue_connect_request(
        &self,
        host: &str,
        port: u16,
        config: Arc<rustls::ClientConfig>,
    ) {
        let target = format!("{}:{}", host, port);
        let req = Request::new(Method::Connect, &target, Version::V1_1);
        req.out_set("Host", &target);

        let weak = self.weak.borrow().clone();
        let host = host.to_string();
        req.set_response_callback(Box::new(move |req, err| {
            let conn = match weak.upgrade() {
                Some(conn) => conn,
                None => return,
            };

            if err != ConnectionError::Ok || req.response_code() / 100 != 2 {
                debug!("CON{}: proxy CONNECT refused", conn.core.id);
                return conn.fail(ConnectionError::Connect);
            }
            if !conn.start_tls(config.clone(), &host) {
                conn.fail(ConnectionError::Connect);
            }
        }));

        self.queue_request(&req);
    }

    fn start_tls(&self, config: Arc<rustls::ClientConfig>, host: &str) -> bool {
        let fd = match self.core.fd.borrow().clone() {
            Some(fd) => fd,
            None => return false,
        };

        match TlsEngine::client(config, host, fd.raw()) {
            Ok(engine) => {
                fd.set_tls(Some(Arc::new(Mutex::new(engine))));
                true
            }
            Err(e) => {
                warn!("CON{}: TLS setup failed: {}", self.core.id, e);
                false
            }
        }
    }

    /// Resolve the peer unless it is already numeric, then connect.
    fn connect(&self, host: &str, port: u16) {
        if let Ok(addr) = SockAddr::parse(host) {
            return self.connect_addr(addr.with_port(port));
        }

        let conn = self.strong();
        let request = self.core.base.dns().resolve(host, move |result| {
            conn.dns.borrow_mut().take();
            match result {
                Ok(addrs) if !addrs.is_empty() => {
                    conn.connect_addr(addrs[0].with_port(port));
                }
                _ => conn.fail(ConnectionError::Connect),
            }
        });
        *self.dns.borrow_mut() = Some(request);
    }

    fn connect_addr(&self, addr: SockAddr) {
        trace!("CON{}: connecting to {}", self.core.id, addr);

        let open = || -> crate::Result<Fd> {
            let mut socket_flags = flags::NONBLOCKING | flags::CLOEXEC;
            if addr.is_ipv6() {
                socket_flags |= flags::IPV6;
            }
            let socket = Socket::open(socket_flags, None)?;
            socket.connect(&addr)?;
            // The socket still owns the fd if registration fails.
            let fd = Fd::new(&self.core.base, socket.raw(), None)?;
            let _ = socket.into_raw();
            Ok(fd)
        };

        let fd = match open() {
            Ok(fd) => fd,
            Err(e) => {
                debug!("CON{}: connect failed: {}", self.core.id, e);
                return self.fail(ConnectionError::Connect);
            }
        };

        fd.set_read_timeout(self.read_timeout.get());
        fd.set_write_timeout(self.write_timeout.get());
        self.core.set_fd(fd);
        *self.core.peer.borrow_mut() = addr;

        let conn = self.strong();
        let fd = self.core.fd.borrow().clone().unwrap();
        fd.can_write(move |success| conn.on_writable(success));
    }

    fn on_writable(&self, success: bool) {
        if !success {
            return self.fail(ConnectionError::Connect);
        }

        let fd = match self.core.fd.borrow().clone() {
            Some(fd) => fd,
            None => return self.fail(ConnectionError::Connect),
        };

        if let Ok(Some(err)) = socket::take_error_fd(fd.raw()) {
            debug!("CON{}: async connect failed: errno {}", self.core.id, err);
            return self.fail(ConnectionError::Connect);
        }

        if let Some((config, host)) = self.tls_plan.borrow_mut().take() {
            if !self.start_tls(config, &host) {
                return self.fail(ConnectionError::Connect);
            }
        }

        trace!("CON{}: connected", self.core.id);
        self.connected.set(true);
        self.dispatch();
    }

    /// Write the pipeline head, if any.
    fn dispatch(&self) {
        if let Some(req) = self.core.front_request() {
            req.write();
        }
    }

    pub(crate) fn write_request(&self, req: &Rc<Request>, buffer: Buffer, has_more: bool) {
        if !self.is_connected() {
            warn!("CON{}: cannot write request, not connected", self.core.id);
            return self.fail(ConnectionError::Unknown);
        }
        if !self.core.check_active(req) {
            return;
        }

        trace!("CON{}: sending request, length={}", self.core.id, buffer.len());

        let conn = self.strong();
        let req = req.clone();
        self.core.write(&buffer, move |success| {
            if !success {
                return conn.fail(conn.write_error());
            }
            if has_more {
                return;
            }
            conn.read_header(req);
        });
    }

    fn read_header(&self, req: Rc<Request>) {
        trace!("CON{}: reading response header", self.core.id);

        let max_header = self.core.max_header_size.get();
        let conn = self.strong();
        self.core
            .read(&self.core.input.clone(), max_header, Some(b"\r\n\r\n"), move |success| {
                if !success {
                    return conn.fail(conn.read_error());
                }

                match conn.core.input.index_of(b"\r\n\r\n") {
                    Some(i) if max_header == 0 || i + 4 <= max_header => conn.read_body(req),
                    _ => conn.fail(ConnectionError::BadResponse),
                }
            });
    }

    fn read_body(&self, req: Rc<Request>) {
        let max_header = self.core.max_header_size.get();

        let line = match self.core.input.read_line(max_header, b"\r\n") {
            Ok(Some(line)) => line,
            _ => return self.fail(ConnectionError::BadResponse),
        };
        if req.parse_response_line(&line).is_err() {
            return self.fail(ConnectionError::BadResponse);
        }

        match req.input_headers_mut().parse(&self.core.input, max_header) {
            Ok(true) => {}
            _ => return self.fail(ConnectionError::BadResponse),
        }

        debug!(
            "CON{}: response {} {}",
            self.core.id,
            req.response_code(),
            req.response_reason()
        );

        // An interim 100 is followed by the real response.
        if req.response_code() == status::CONTINUE {
            *req.input_headers_mut() = crate::http::Headers::new();
            return self.read_header(req);
        }

        if !req.must_have_body() {
            return self.process(req);
        }

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
                        conn.process(req2);
                    } else {
                        conn.fail(ConnectionError::BadResponse);
                    }
                }),
            );
        }

        let content_length = match req.in_get("Content-Length") {
            Some(s) => match s.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => return self.fail(ConnectionError::BadResponse),
            },
            None => None,
        };

        let max_body = self.core.max_body_size.get();

        let read_size = match content_length {
            Some(length) => {
                if max_body != 0 && max_body < length {
                    return self.fail(ConnectionError::BadResponse);
                }
                let buffered = self.core.input.len();
                if buffered < length {
                    self.core.input.expand(length - buffered);
                }
                length
            }
            None => {
                // Without a length the body runs to EOF, which only works
                // when the peer is closing.
                if !req.input_headers().needs_close() {
                    return self.fail(ConnectionError::BadResponse);
                }
                if max_body != 0 {
                    max_body
                } else {
                    usize::MAX
                }
            }
        };

        let conn = self.strong();
        self.core
            .read(&self.core.input.clone(), read_size, None, move |_| {
                if let Some(length) = content_length {
                    if conn.core.input.len() < length {
                        return conn.fail(conn.read_error());
                    }
                }
                conn.process(req);
            });
    }

    /// Complete the pipeline head and move on.
    fn process(&self, req: Rc<Request>) {
        self.core.pop_request();

        // Upgraded responses keep their bytes on the connection for the
        // new protocol.
        if req.response_code() != status::SWITCHING_PROTOCOLS {
            let _ = req.input_buffer().add_buffer(&self.core.input);
        }

        req.respond(ConnectionError::Ok);

        if req.is_upgraded() || req.response_code() == status::SWITCHING_PROTOCOLS {
            return;
        }

        if req.is_persistent() {
            self.dispatch();
        } else {
            self.close();
        }
    }

    fn read_error(&self) -> ConnectionError {
        let timedout = self
            .core
            .fd
            .borrow()
            .as_ref()
            .map_or(false, |fd| fd.status().read_timedout());
        if timedout {
            ConnectionError::Timeout
        } else {
            ConnectionError::Eof
        }
    }

    fn write_error(&self) -> ConnectionError {
        let timedout = self
            .core
            .fd
            .borrow()
            .as_ref()
            .map_or(false, |fd| fd.status().write_timedout());
        if timedout {
            ConnectionError::Timeout
        } else {
            ConnectionError::Eof
        }
    }

    /// Fail every queued request with one disposition and close.
    pub(crate) fn fail(&self, err: ConnectionError) {
        debug!("CON{}: failed: {}", self.core.id, err);

        let requests: Vec<_> = self.core.requests.borrow_mut().drain(..).collect();
        for req in requests {
            req.respond(err);
        }
        self.close();
    }

    pub(crate) fn close(&self) {
        let conn = self.strong();
        if let Some(dns) = conn.dns.borrow_mut().take() {
            dns.cancel();
        }
        conn.connected.set(false);
        conn.core.close_fd();

        // Anything still queued can no longer complete.
        while let Some(req) = conn.core.pop_request() {
            req.respond(ConnectionError::Canceled);
        }
    }
}
