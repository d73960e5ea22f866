use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt::Write as _;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use url::Url;

use crate::buffer::Buffer;
use crate::error::ConnectionError;
use crate::http::client::ConnOut;
use crate::http::headers::Headers;
use crate::http::server::ConnIn;
use crate::http::{status, Method, Version};
use crate::net::SockAddr;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum ConnRef {
    None,
    In(Weak<ConnIn>),
    Out(Weak<ConnOut>),
}

type ResponseCallback = Box<dyn FnOnce(&Rc<Request>, ConnectionError)>;

/// One HTTP exchange: a request and its response, on either side of the
/// wire.
///
/// On the server a `Request` arrives parsed and is answered with
/// [`reply`]; on the client it is built, sent through a
/// [`Client`], and completed by its response callback.
///
/// [`reply`]: Request::reply
/// [`Client`]: crate::http::Client
pub struct Request {
    weak: RefCell<Weak<Request>>,
    id: u64,
    method: Cell<Method>,
    uri: RefCell<String>,
    url: RefCell<Option<Url>>,
    version: Cell<Version>,
    input_headers: RefCell<Headers>,
    output_headers: RefCell<Headers>,
    input_buffer: Buffer,
    output_buffer: Buffer,
    response_code: Cell<u16>,
    response_reason: RefCell<String>,
    client_addr: RefCell<SockAddr>,
    session: RefCell<Option<String>>,
    finalized: Cell<bool>,
    upgraded: Cell<bool>,
    /// Request the full target be written in absolute form (HTTP proxies).
    absolute_form: Cell<bool>,
    conn: RefCell<ConnRef>,
    on_response: RefCell<Option<ResponseCallback>>,
}

impl Request {
    pub fn new(method: Method, uri: &str, version: Version) -> Rc<Request> {
        let req = Rc::new(Request {
            weak: RefCell::new(Weak::new()),
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method: Cell::new(method),
            uri: RefCell::new(uri.to_string()),
            url: RefCell::new(None),
            version: Cell::new(version),
            input_headers: RefCell::new(Headers::new()),
            output_headers: RefCell::new(Headers::new()),
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
            response_code: Cell::new(0),
            response_reason: RefCell::new(String::new()),
            client_addr: RefCell::new(SockAddr::null()),
            session: RefCell::new(None),
            finalized: Cell::new(false),
            upgraded: Cell::new(false),
            absolute_form: Cell::new(false),
            conn: RefCell::new(ConnRef::None),
            on_response: RefCell::new(None),
        });
        *req.weak.borrow_mut() = Rc::downgrade(&req);
        req
    }

    pub(crate) fn with_url(method: Method, url: Url, version: Version) -> Rc<Request> {
        let req = Request::new(method, url.path(), version);
        *req.url.borrow_mut() = Some(url);
        req
    }

    fn strong(&self) -> Rc<Request> {
        self.weak.borrow().upgrade().expect("request dropped")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> Method {
        self.method.get()
    }

    pub fn uri(&self) -> String {
        self.uri.borrow().clone()
    }

    pub fn url(&self) -> Option<Url> {
        self.url.borrow().clone()
    }

    pub fn version(&self) -> Version {
        self.version.get()
    }

    pub fn client_addr(&self) -> SockAddr {
        *self.client_addr.borrow()
    }

    pub(crate) fn set_client_addr(&self, addr: SockAddr) {
        *self.client_addr.borrow_mut() = addr;
    }

    pub fn session(&self) -> Option<String> {
        self.session.borrow().clone()
    }

    pub fn set_session(&self, session: Option<String>) {
        *self.session.borrow_mut() = session;
    }

    pub fn input_headers(&self) -> Ref<'_, Headers> {
        self.input_headers.borrow()
    }

    pub fn input_headers_mut(&self) -> RefMut<'_, Headers> {
        self.input_headers.borrow_mut()
    }

    pub fn output_headers(&self) -> Ref<'_, Headers> {
        self.output_headers.borrow()
    }

    pub fn output_headers_mut(&self) -> RefMut<'_, Headers> {
        self.output_headers.borrow_mut()
    }

    /// First value of an input header.
    pub fn in_get(&self, key: &str) -> Option<String> {
        self.input_headers.borrow().get(key).map(str::to_string)
    }

    pub fn out_set(&self, key: &str, value: &str) {
        self.output_headers.borrow_mut().set(key, value);
    }

    /// Body received from the peer.
    pub fn input_buffer(&self) -> Buffer {
        self.input_buffer.clone()
    }

    /// Body to send to the peer.
    pub fn output_buffer(&self) -> Buffer {
        self.output_buffer.clone()
    }

    pub fn response_code(&self) -> u16 {
        self.response_code.get()
    }

    pub fn response_reason(&self) -> String {
        self.response_reason.borrow().clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }

    pub(crate) fn is_upgraded(&self) -> bool {
        self.upgraded.get()
    }

    pub(crate) fn set_upgraded(&self) {
        self.upgraded.set(true);
    }

    pub(crate) fn set_absolute_form(&self) {
        self.absolute_form.set(true);
    }

    pub(crate) fn set_conn(&self, conn: ConnRef) {
        *self.conn.borrow_mut() = conn;
    }

    pub(crate) fn conn_in(&self) -> Option<Rc<ConnIn>> {
        match &*self.conn.borrow() {
            ConnRef::In(weak) => weak.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn conn_out(&self) -> Option<Rc<ConnOut>> {
        match &*self.conn.borrow() {
            ConnRef::Out(weak) => weak.upgrade(),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        match &*self.conn.borrow() {
            ConnRef::In(weak) => weak.upgrade().map_or(false, |c| c.is_connected()),
            ConnRef::Out(weak) => weak.upgrade().map_or(false, |c| c.is_connected()),
            ConnRef::None => false,
        }
    }

    pub(crate) fn set_response_callback(&self, cb: ResponseCallback) {
        *self.on_response.borrow_mut() = Some(cb);
    }

    pub(crate) fn take_response_callback(&self) {
        self.on_response.borrow_mut().take();
    }

    /// Deliver the final disposition to the response callback, once.
    pub(crate) fn respond(&self, err: ConnectionError) {
        if let Some(cb) = self.on_response.borrow_mut().take() {
            cb(&self.strong(), err);
        }
    }

    pub(crate) fn parse_response_line(&self, line: &str) -> crate::Result<()> {
        let mut parts = line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| crate::Error::Protocol("empty response line".into()))?;
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .filter(|c| (100..600).contains(c))
            .ok_or_else(|| crate::Error::Protocol(format!("invalid response line '{}'", line)))?;

        self.version.set(Version::parse(version)?);
        self.response_code.set(code);
        *self.response_reason.borrow_mut() = parts.next().unwrap_or("").to_string();
        Ok(())
    }

    /// May an incoming request with these headers carry a body?
    pub(crate) fn may_have_body(&self) -> bool {
        matches!(
            self.method.get(),
            Method::Post | Method::Put | Method::Patch
        ) || self.input_headers.borrow().has("Content-Length")
            || self.input_headers.borrow().has("Transfer-Encoding")
    }

    /// Must a response to this request carry a body?
    pub(crate) fn must_have_body(&self) -> bool {
        let code = self.response_code.get();
        self.method.get() != Method::Head
            && self.method.get() != Method::Connect
            && 200 <= code
            && code != status::NO_CONTENT
            && code != status::NOT_MODIFIED
    }

    /// Keep-alive discipline: HTTP/1.1 persists unless either side says
    /// close; HTTP/1.0 persists only with an explicit keep-alive.
    pub fn is_persistent(&self) -> bool {
        let input = self.input_headers.borrow();
        let output = self.output_headers.borrow();

        if Version::V1_1 <= self.version.get() {
            !input.needs_close() && !output.needs_close()
        } else {
            input.keep_alive() && !output.needs_close()
        }
    }

    /// The request line as received.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method.get(), self.uri.borrow(), self.version.get())
    }

    /// Send a response with this status and the current output buffer.
    pub fn reply(&self, code: u16) {
        self.reply_with(code, &[]);
    }

    /// Send a response; a non-empty `body` replaces the output buffer.
    pub fn reply_with(&self, code: u16, body: &[u8]) {
        if self.finalized.replace(true) {
            warn!("REQ{}: already replied", self.id);
            return;
        }

        let conn = match self.conn_in() {
            Some(conn) => conn,
            None => return,
        };

        if !body.is_empty() {
            self.output_buffer.clear();
            let _ = self.output_buffer.add(body);
        }
        self.response_code.set(code);

        let buffer = self.marshal_response(code);
        conn.write_request(&self.strong(), buffer, false);
    }

    /// Respond with an error status and a plain-text body, closing the
    /// connection afterwards.
    pub fn send_error(&self, code: u16, message: &str) {
        self.out_set("Content-Type", "text/plain");
        self.out_set("Connection", "close");
        self.reply_with(code, message.as_bytes());
    }

    fn marshal_response(&self, code: u16) -> Buffer {
        let version = self.version.get();
        let has_body = self.must_have_body() && self.method.get() != Method::Head;

        let mut head = String::new();
        let _ = write!(head, "{} {} {}\r\n", version, code, status::reason(code));

        {
            let mut headers = self.output_headers.borrow_mut();
            let body_allowed = !(code < 200 || code == status::NO_CONTENT || code == status::NOT_MODIFIED);
            if body_allowed
                && !headers.has("Content-Length")
                && !headers.has("Transfer-Encoding")
            {
                headers.set("Content-Length", &self.output_buffer.len().to_string());
            }
            headers.write_to(&mut head);
        }
        head.push_str("\r\n");

        let buffer = Buffer::new();
        let _ = buffer.add_str(&head);
        if has_body {
            let _ = buffer.add_buffer(&self.output_buffer);
        }
        buffer
    }

    /// Serialize the outgoing request line, headers and body.
    pub(crate) fn marshal_request(&self) -> Buffer {
        let url = self.url.borrow();

        let target = if self.method.get() == Method::Connect {
            self.uri.borrow().clone()
        } else if self.absolute_form.get() {
            url.as_ref()
                .map(|u| u.to_string())
                .unwrap_or_else(|| self.uri.borrow().clone())
        } else {
            match url.as_ref() {
                Some(u) => match u.query() {
                    Some(q) => format!("{}?{}", u.path(), q),
                    None => u.path().to_string(),
                },
                None => self.uri.borrow().clone(),
            }
        };

        let mut head = String::new();
        let _ = write!(head, "{} {} {}\r\n", self.method.get(), target, self.version.get());

        {
            let mut headers = self.output_headers.borrow_mut();

            if !headers.has("Host") {
                if let Some(u) = url.as_ref() {
                    if let Some(host) = u.host_str() {
                        let host = match u.port() {
                            Some(port) => format!("{}:{}", host, port),
                            None => host.to_string(),
                        };
                        headers.set("Host", &host);
                    }
                }
            }

            if !self.output_buffer.is_empty() && !headers.has("Content-Length") {
                headers.set("Content-Length", &self.output_buffer.len().to_string());
            }

            headers.write_to(&mut head);
        }
        head.push_str("\r\n");

        let buffer = Buffer::new();
        let _ = buffer.add_str(&head);
        let _ = buffer.add_ref(&self.output_buffer);
        buffer
    }

    /// Write this request out on its client connection.
    pub(crate) fn write(&self) {
        if let Some(conn) = self.conn_out() {
            let buffer = self.marshal_request();
            conn.write_request(&self.strong(), buffer, false);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method.get())
            .field("uri", &*self.uri.borrow())
            .field("code", &self.response_code.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_rules() {
        let req = Request::new(Method::Get, "/", Version::V1_1);
        assert!(req.is_persistent());

        req.input_headers_mut().set("Connection", "close");
        assert!(!req.is_persistent());

        let req = Request::new(Method::Get, "/", Version::V1_0);
        assert!(!req.is_persistent());
        req.input_headers_mut().set("Connection", "keep-alive");
        assert!(req.is_persistent());
    }

    #[test]
    fn response_line_parsing() {
        let req = Request::new(Method::Get, "/", Version::V1_1);
        req.parse_response_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(req.response_code(), 404);
        assert_eq!(req.response_reason(), "Not Found");

        assert!(req.parse_response_line("HTTP/1.1").is_err());
        assert!(req.parse_response_line("HTTP/1.1 999 Nope").is_err());
        assert!(req.parse_response_line("FTP/1.1 200 OK").is_err());
    }

    #[test]
    fn request_marshalling() {
        let url = Url::parse("http://example.com:8080/a/b?q=1").unwrap();
        let req = Request::with_url(Method::Get, url, Version::V1_1);
        let wire = req.marshal_request().to_string_lossy();

        assert!(wire.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert!(wire.contains("Host: example.com:8080\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn absolute_form_for_proxies() {
        let url = Url::parse("http://example.com/x").unwrap();
        let req = Request::with_url(Method::Get, url, Version::V1_1);
        req.set_absolute_form();
        let wire = req.marshal_request().to_string_lossy();
        assert!(wire.starts_with("GET http://example.com/x HTTP/1.1\r\n"));
    }

    #[test]
    fn body_rules() {
        let req = Request::new(Method::Get, "/", Version::V1_1);
        assert!(!req.may_have_body());
        req.input_headers_mut().set("Content-Length", "10");
        assert!(req.may_have_body());

        let req = Request::new(Method::Head, "/", Version::V1_1);
        req.response_code.set(200);
        assert!(!req.must_have_body());

        let req = Request::new(Method::Get, "/", Version::V1_1);
        req.response_code.set(204);
        assert!(!req.must_have_body());
        req.response_code.set(200);
        assert!(req.must_have_body());
    }
}
