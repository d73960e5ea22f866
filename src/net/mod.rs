//! Addresses, ranges, sockets and the TLS engine.

mod filter;
mod range;
mod sockaddr;
pub(crate) mod socket;
pub(crate) mod tls;

pub use filter::AddressFilter;
pub use range::{AddressRange, AddressRangeSet};
pub use sockaddr::SockAddr;
pub use socket::Socket;
pub use tls::{SharedTls, TlsEngine};
