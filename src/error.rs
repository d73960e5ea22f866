use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the networking core.
///
/// Transfer-level failures never surface as `Error` values; they are reported
/// through the completion callback's `success` flag. `Error` covers
/// everything above and below the transfer layer: syscalls, parsing,
/// protocol limits and connection setup.
#[derive(Debug, Error)]
pub enum Error {
    /// A socket or file syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Orderly peer close on a stream we were still reading.
    #[error("end of stream")]
    EndOfStream,

    /// TLS handshake or record processing failed.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A transfer exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// Malformed request line, header block, chunk framing or WebSocket
    /// frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A configured header or body size limit was exceeded.
    #[error("limit exceeded: {0}")]
    Limit(String),

    /// DNS lookup, connect or proxy negotiation failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The operation was canceled by a flush or close.
    #[error("canceled")]
    Canceled,

    /// A buffer operation failed: frozen end, read past the end, or an OS
    /// failure while appending a file.
    #[error("buffer error: {0}")]
    Buffer(String),

    /// A socket address or address range failed to parse.
    #[error("invalid address: {0}")]
    Addr(String),
}

impl Error {
    /// True for errors a non-blocking retry may clear.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Final disposition of an outgoing HTTP request.
///
/// Exactly one of these is delivered to the request callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The exchange completed and a response was parsed.
    Ok,
    /// DNS lookup, TCP connect or proxy negotiation failed.
    Connect,
    /// A read or write transfer timed out.
    Timeout,
    /// The peer closed the connection mid-exchange.
    Eof,
    /// The response line, headers or body framing was malformed.
    BadResponse,
    /// The request was canceled before completion.
    Canceled,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionError::Ok => "ok",
            ConnectionError::Connect => "connect failed",
            ConnectionError::Timeout => "timed out",
            ConnectionError::Eof => "unexpected end of stream",
            ConnectionError::BadResponse => "bad response",
            ConnectionError::Canceled => "canceled",
            ConnectionError::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}
