//! WebSocket framing on top of an upgraded HTTP connection (RFC 6455).

pub mod frame;

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::event::{Event, EventFlags};
use crate::http::client::Client;
use crate::http::conn::HttpConn;
use crate::http::request::Request;
use crate::http::{status, Method, Version};

use frame::close;

const PONG_DELAY: Duration = Duration::from_secs(5);
const PING_MIN: Duration = Duration::from_secs(5);
const OUT_FRAME_SIZE: usize = 0xffff;

/// Callbacks driving one WebSocket.
///
/// Unset hooks default to doing nothing; ping/pong scheduling is handled
/// internally either way.
#[derive(Default)]
pub struct WebsocketHandlers {
    pub on_open: Option<Box<dyn FnMut(&Rc<Websocket>)>>,
    pub on_message: Option<Box<dyn FnMut(&Rc<Websocket>, &[u8])>>,
    pub on_close: Option<Box<dyn FnMut(u16, &str)>>,
}

/// One WebSocket, either side of the wire.
///
/// Created by [`upgrade`] on a server request carrying the handshake
/// headers, or by [`connect`] from a client. Fragmented messages are
/// delivered whole; control frames are handled between fragments.
///
/// [`upgrade`]: Websocket::upgrade
/// [`connect`]: Websocket::connect
pub struct Websocket {
    req: Rc<Request>,
    conn: RefCell<Option<Rc<dyn HttpConn>>>,
    /// Server side? Inbound frames must be masked exactly when true.
    incoming: bool,
    active: Cell<bool>,
    closed: Cell<bool>,
    handlers: RefCell<WebsocketHandlers>,
    msg: RefCell<Vec<u8>>,
    header: Cell<frame::FrameHeader>,
    msg_sent: Cell<u64>,
    msg_received: Cell<u64>,
    ping_event: RefCell<Option<Event>>,
    pong_event: RefCell<Option<Event>>,
    pong_payload: RefCell<Vec<u8>>,
    weak: RefCell<Weak<Websocket>>,
}

impl Websocket {
    fn new(req: Rc<Request>, incoming: bool, handlers: WebsocketHandlers) -> Rc<Websocket> {
        let ws = Rc::new(Websocket {
            req,
            conn: RefCell::new(None),
            incoming,
            active: Cell::new(false),
            closed: Cell::new(false),
            handlers: RefCell::new(handlers),
            msg: RefCell::new(Vec::new()),
            header: Cell::new(frame::FrameHeader {
                fin: true,
                opcode: frame::OP_CONTINUE,
                masked: false,
                len: 0,
                mask: [0; 4],
            }),
            msg_sent: Cell::new(0),
            msg_received: Cell::new(0),
            ping_event: RefCell::new(None),
            pong_event: RefCell::new(None),
            pong_payload: RefCell::new(Vec::new()),
            weak: RefCell::new(Weak::new()),
        });
        *ws.weak.borrow_mut() = Rc::downgrade(&ws);
        ws
    }

    fn strong(&self) -> Rc<Websocket> {
        self.weak.borrow().upgrade().expect("websocket dropped")
    }

    /// Upgrade a server request to a WebSocket.
    ///
    /// Requires `Connection: upgrade`, a `Sec-WebSocket-Key` and HTTP/1.1
    /// or later; replies `101 Switching Protocols` and starts the frame
    /// loop.
    pub fn upgrade(req: &Rc<Request>, handlers: WebsocketHandlers) -> crate::Result<Rc<Websocket>> {
        let conn = req
            .conn_in()
            .ok_or_else(|| crate::Error::Protocol("not an incoming request".into()))?;

        let upgradable = req.input_headers().key_contains("Connection", "upgrade");
        let key = req.in_get("Sec-WebSocket-Key").unwrap_or_default();
        if !upgradable || key.is_empty() || req.version() < Version::V1_1 {
            return Err(crate::Error::Protocol(
                "request is not a WebSocket upgrade".into(),
            ));
        }

        let ws = Websocket::new(req.clone(), true, handlers);
        *ws.conn.borrow_mut() = Some(conn);
        ws.active.set(true);
        req.set_upgraded();

        req.out_set("Upgrade", "websocket");
        req.out_set("Connection", "upgrade");
        req.out_set("Sec-WebSocket-Accept", &frame::accept_key(&key));
        req.reply(status::SWITCHING_PROTOCOLS);

        ws.opened();
        Ok(ws)
    }

    /// Open a client WebSocket; `ws`/`wss` and `http`/`https` URLs are
    /// accepted.
    pub fn connect(
        client: &Client,
        url: &str,
        handlers: WebsocketHandlers,
    ) -> crate::Result<Rc<Websocket>> {
        let url = if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else {
            url.to_string()
        };
        let url = url::Url::parse(&url)
            .map_err(|e| crate::Error::Connect(format!("invalid URL: {}", e)))?;

        let req = Request::with_url(Method::Get, url, Version::V1_1);
        let key = frame::generate_key();
        req.out_set("Sec-WebSocket-Key", &key);
        req.out_set("Sec-WebSocket-Version", "13");
        req.out_set("Upgrade", "websocket");
        req.out_set("Connection", "upgrade");

        let ws = Websocket::new(req.clone(), false, handlers);

        // The callback owns the websocket until the handshake resolves;
        // afterwards the read chain keeps it alive.
        let handshake_ws = ws.clone();
        req.set_response_callback(Box::new(move |req, err| {
            let ws = handshake_ws;
            let accept = req.in_get("Sec-WebSocket-Accept").unwrap_or_default();
            let ok = err == crate::ConnectionError::Ok
                && req.response_code() == status::SWITCHING_PROTOCOLS
                && accept == frame::accept_key(&key);

            if !ok {
                debug!("WS{}: handshake failed: {}", req.id(), err);
                ws.fire_close(close::ABNORMAL, "handshake failed");
                return;
            }

            *ws.conn.borrow_mut() = req.conn_out().map(|c| c as Rc<dyn HttpConn>);
            req.set_upgraded();
            ws.active.set(true);
            ws.opened();
        }));

        if let Err(e) = client.send(&req) {
            // Break the request/websocket cycle before reporting.
            req.take_response_callback();
            return Err(e);
        }
        Ok(ws)
    }

    fn opened(&self) {
        // Handlers run with the registry released so they may re-enter.
        let mut on_open = self.handlers.borrow_mut().on_open.take();
        if let Some(f) = on_open.as_mut() {
            f(&self.strong());
        }
        if let Some(f) = on_open {
            let mut handlers = self.handlers.borrow_mut();
            if handlers.on_open.is_none() {
                handlers.on_open = Some(f);
            }
        }

        self.read_frame_header();
        self.schedule_ping();
    }

    pub fn request(&self) -> &Rc<Request> {
        &self.req
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
            && self
                .conn
                .borrow()
                .as_ref()
                .map_or(false, |c| c.core().is_connected())
    }

    /// Messages delivered to `on_message`; pings and pongs do not count.
    pub fn messages_received(&self) -> u64 {
        self.msg_received.get()
    }

    pub fn messages_sent(&self) -> u64 {
        self.msg_sent.get()
    }

    /// Send a text message, fragmenting above 64 KiB.
    pub fn send(&self, data: &[u8]) {
        self.send_message(frame::OP_TEXT, data);
    }

    pub fn send_binary(&self, data: &[u8]) {
        self.send_message(frame::OP_BINARY, data);
    }

    fn send_message(&self, opcode: u8, data: &[u8]) {
        if data.len() <= OUT_FRAME_SIZE {
            self.write_frame(opcode, true, data);
        } else {
            let mut i = 0;
            while i < data.len() {
                let n = OUT_FRAME_SIZE.min(data.len() - i);
                let op = if i == 0 { opcode } else { frame::OP_CONTINUE };
                self.write_frame(op, i + n == data.len(), &data[i..i + n]);
                i += n;
            }
        }
        self.msg_sent.set(self.msg_sent.get() + 1);
    }

    pub fn ping(&self, payload: &[u8]) {
        self.write_frame(frame::OP_PING, true, payload);
    }

    /// Send a close frame and shut the connection down.
    pub fn close(&self, status: u16, reason: &str) {
        debug!("WS{}: closing, status={} '{}'", self.req.id(), status, reason);

        if let Some(event) = self.ping_event.borrow_mut().take() {
            event.del();
        }
        if let Some(event) = self.pong_event.borrow_mut().take() {
            event.del();
        }

        if self.is_active() {
            let status = if status == close::NONE { close::NORMAL } else { status };
            let mut payload = status.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            self.write_frame(frame::OP_CLOSE, true, &payload);
        }

        self.fire_close(status, reason);
    }

    fn fire_close(&self, status: u16, reason: &str) {
        self.active.set(false);
        if !self.closed.replace(true) {
            let mut on_close = self.handlers.borrow_mut().on_close.take();
            if let Some(f) = on_close.as_mut() {
                f(status, reason);
            }
        }
    }

    fn read_frame_header(&self) {
        let conn = match self.conn.borrow().clone() {
            Some(conn) => conn,
            None => return,
        };
        let input = conn.core().input.clone();

        let ws = self.strong();
        conn.core().read(&input, 2, None, move |success| {
            if !success {
                return ws.close(close::PROTOCOL, "");
            }

            let conn = match ws.conn.borrow().clone() {
                Some(conn) => conn,
                None => return,
            };

            let mut first = [0u8; 2];
            conn.core().input.copy_out(&mut first);

            // Client-to-server frames are masked; server-to-client never.
            let masked = first[1] & 0x80 != 0;
            if masked != ws.incoming {
                return ws.close(close::PROTOCOL, "bad mask bit");
            }

            let total = frame::header_size(first);
            let input = conn.core().input.clone();
            let ws2 = ws.strong();
            conn.core().read(&input, total, None, move |success| {
                if !success {
                    return ws2.close(close::PROTOCOL, "");
                }
                ws2.process_frame_header(total);
            });
        });
    }

    fn process_frame_header(&self, total: usize) {
        let conn = match self.conn.borrow().clone() {
            Some(conn) => conn,
            None => return,
        };

        let mut raw = [0u8; frame::MAX_HEADER];
        if conn.core().input.remove(&mut raw[..total]).is_err() {
            return self.close(close::PROTOCOL, "");
        }

        let header = match frame::parse_header(&raw[..total]) {
            Ok(header) => header,
            Err(_) => return self.close(close::PROTOCOL, "bad frame header"),
        };

        trace!(
            "WS{}: frame opcode={} fin={} len={}",
            self.req.id(),
            header.opcode,
            header.fin,
            header.len
        );

        // Control frames must be whole and small.
        if header.is_control() && (!header.fin || 125 < header.len) {
            return self.close(close::PROTOCOL, "fragmented control frame");
        }

        if !header.is_control() && header.opcode != frame::OP_CONTINUE {
            self.msg.borrow_mut().clear();
        }

        let max = conn.core().max_body_size.get();
        if max != 0 && (max as u64) < self.msg.borrow().len() as u64 + header.len {
            return self.close(close::TOO_BIG, "message too large");
        }

        self.header.set(header);
        self.read_frame_body();
    }

    fn read_frame_body(&self) {
        let conn = match self.conn.borrow().clone() {
            Some(conn) => conn,
            None => return,
        };
        let input = conn.core().input.clone();
        let len = self.header.get().len as usize;

        let ws = self.strong();
        conn.core().read(&input, len, None, move |success| {
            if !success {
                return ws.close(close::PROTOCOL, "");
            }
            ws.process_frame_body();
        });
    }

    fn process_frame_body(&self) {
        let conn = match self.conn.borrow().clone() {
            Some(conn) => conn,
            None => return,
        };
        let header = self.header.get();

        let mut payload = vec![0u8; header.len as usize];
        if conn.core().input.remove(&mut payload).is_err() {
            return self.close(close::PROTOCOL, "");
        }
        if header.masked {
            frame::apply_mask(&mut payload, header.mask);
        }

        match header.opcode {
            frame::OP_CONTINUE | frame::OP_TEXT | frame::OP_BINARY => {
                self.msg.borrow_mut().extend_from_slice(&payload);
                if header.fin {
                    self.message();
                }
            }

            frame::OP_CLOSE => {
                let status = if 2 <= payload.len() {
                    u16::from_be_bytes([payload[0], payload[1]])
                } else {
                    close::NONE
                };
                let reason = if 2 < payload.len() {
                    String::from_utf8_lossy(&payload[2..]).into_owned()
                } else {
                    String::new()
                };
                // Echo the peer's status back and shut down.
                return self.close(status, &reason);
            }

            frame::OP_PING => {
                *self.pong_payload.borrow_mut() = payload;
                self.schedule_pong();
            }

            frame::OP_PONG => self.schedule_ping(),

            _ => return self.close(close::PROTOCOL, "unknown opcode"),
        }

        if self.is_active() {
            self.read_frame_header();
        }
    }

    /// Deliver a complete message.
    fn message(&self) {
        self.msg_received.set(self.msg_received.get() + 1);

        // Incoming traffic postpones the next keep-alive ping.
        let pending = self
            .ping_event
            .borrow()
            .as_ref()
            .map_or(false, |e| e.is_pending());
        if pending {
            self.schedule_ping();
        }

        let msg = std::mem::take(&mut *self.msg.borrow_mut());
        let mut on_message = self.handlers.borrow_mut().on_message.take();
        if let Some(f) = on_message.as_mut() {
            f(&self.strong(), &msg);
        }
        if let Some(f) = on_message {
            let mut handlers = self.handlers.borrow_mut();
            if handlers.on_message.is_none() {
                handlers.on_message = Some(f);
            }
        }
    }

    fn write_frame(&self, opcode: u8, fin: bool, payload: &[u8]) {
        if !self.is_active() {
            warn!("WS{}: not active, dropping frame", self.req.id());
            return;
        }
        let conn = match self.conn.borrow().clone() {
            Some(conn) => conn,
            None => return,
        };

        // Clients mask every outgoing frame with a fresh random key.
        let mask = if self.incoming {
            None
        } else {
            Some(frame::generate_mask())
        };

        let mut header = [0u8; frame::MAX_HEADER];
        let size = frame::encode_header(&mut header, opcode, fin, mask, payload.len() as u64);

        let buffer = Buffer::new();
        let _ = buffer.add(&header[..size]);
        match mask {
            Some(mask) => {
                let mut masked = payload.to_vec();
                frame::apply_mask(&mut masked, mask);
                let _ = buffer.add(&masked);
            }
            None => {
                let _ = buffer.add(payload);
            }
        }

        let ws = self.strong();
        conn.core().write(&buffer, move |success| {
            if !success || opcode == frame::OP_CLOSE {
                if let Some(conn) = ws.conn.borrow_mut().take() {
                    conn.shutdown();
                }
            }
        });
    }

    fn pong(&self) {
        let payload = std::mem::take(&mut *self.pong_payload.borrow_mut());
        self.write_frame(frame::OP_PONG, true, &payload);
    }

    /// Aggregate backlogged pings into one delayed pong.
    fn schedule_pong(&self) {
        if !self.active.get() {
            return;
        }

        if self.pong_event.borrow().is_none() {
            let weak = self.weak.borrow().clone();
            let event = self.base().new_event(
                move || {
                    if let Some(ws) = weak.upgrade() {
                        ws.pong();
                    }
                },
                EventFlags::NO_SELF_REF,
            );
            *self.pong_event.borrow_mut() = Some(event);
        }

        let pong = self.pong_event.borrow();
        let event = pong.as_ref().unwrap();
        if !event.is_pending() {
            event.add_timeout(PONG_DELAY);
        }
    }

    /// Ping when the peer has been quiet for half the read timeout.
    fn schedule_ping(&self) {
        if !self.active.get() {
            return;
        }

        if self.ping_event.borrow().is_none() {
            let weak = self.weak.borrow().clone();
            let event = self.base().new_event(
                move || {
                    if let Some(ws) = weak.upgrade() {
                        ws.ping(b"");
                    }
                },
                EventFlags::NO_SELF_REF,
            );
            *self.ping_event.borrow_mut() = Some(event);
        }

        let timeout = self
            .conn
            .borrow()
            .as_ref()
            .and_then(|c| c.core().read_timeout())
            .map(|t| {
                if Duration::from_secs(10) < t {
                    t / 2
                } else {
                    PING_MIN
                }
            })
            .unwrap_or(PING_MIN);

        self.ping_event.borrow().as_ref().unwrap().add_timeout(timeout);
    }

    fn base(&self) -> crate::EventLoop {
        self.conn
            .borrow()
            .as_ref()
            .map(|c| c.core().base.clone())
            .expect("websocket has no connection")
    }
}
