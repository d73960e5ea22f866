//! Event-driven networking with a worker-thread FD pool.
//!
//! evio multiplexes asynchronous byte transfers over TCP and TLS sockets
//! behind a single-threaded callback [`EventLoop`], and layers an HTTP/1.1
//! client and server (chunked transfer handling, keep-alive pipelining,
//! TLS upgrade) plus RFC 6455 WebSocket framing on top.
//!
//! # Architecture
//!
//! Two threads matter. The *event loop thread* runs every user callback and
//! never blocks on I/O. The *pool worker thread* drives its own epoll loop,
//! executes [`Transfer`]s (including TLS record work) directly against the
//! sockets, and posts progress and completions back to the loop over
//! single-producer single-consumer queues. A loop-driven fallback pool with
//! identical semantics is available via [`PoolBackend::Loop`].
//!
//! Opening an [`Fd`] registers it with the pool. Each read or write request
//! becomes a [`Transfer`] queued on that fd's direction; transfers on one
//! direction complete in submission order, and every completion callback
//! runs exactly once, on the loop thread.
//!
//! # Example
//!
//! A minimal HTTP server:
//!
//! ```no_run
//! use evio::{EventLoop, http::Server};
//!
//! fn main() -> evio::Result<()> {
//!     let base = EventLoop::new()?;
//!
//!     let server = Server::new(&base, |req| {
//!         req.reply_with(200, b"hello\n");
//!         Ok(())
//!     });
//!     server.bind(&"127.0.0.1:8080".parse()?)?;
//!
//!     base.run()
//! }
//! ```

pub mod buffer;
pub mod dns;
mod error;
mod event;
mod event_loop;
mod fd;
pub mod http;
pub mod net;
pub mod pool;
mod progress;
mod sys;
mod transfer;
pub mod ws;

pub use buffer::Buffer;
pub use error::{ConnectionError, Error, Result};
pub use event::{Activator, Event, EventFlags, EventSet};
pub use event_loop::{EventLoop, LoopConfig};
pub use fd::Fd;
pub use net::{AddressFilter, AddressRange, AddressRangeSet, SockAddr, Socket};
pub use pool::{FdPool, FdStatus, PoolBackend};
pub use progress::{Progress, RateTracker};
pub use transfer::Transfer;
pub use ws::Websocket;

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize process-wide socket state; idempotent.
///
/// Called by [`EventLoop::new`] and [`Socket::open`]. Writes to closed
/// sockets must surface as `EPIPE` errors rather than `SIGPIPE`.
pub fn init() {
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
