//! HTTP/1.1 protocol engine: framing, connections, client and server.

pub mod client;
pub(crate) mod conn;
pub mod headers;
pub mod options;
pub mod request;
pub mod server;
pub mod status;

pub use client::Client;
pub use headers::Headers;
pub use options::ServerOptions;
pub use request::Request;
pub use server::Server;

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Request methods; anything unrecognized parses as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
    Patch,
    Unknown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Method, Self::Err> {
        Ok(match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const V1_0: Version = Version { major: 1, minor: 0 };
    pub const V1_1: Version = Version { major: 1, minor: 1 };

    /// Parse "HTTP/M.m".
    pub fn parse(s: &str) -> crate::Result<Version> {
        let rest = s
            .strip_prefix("HTTP/")
            .ok_or_else(|| Error::Protocol(format!("invalid HTTP version '{}'", s)))?;
        let (major, minor) = rest
            .split_once('.')
            .ok_or_else(|| Error::Protocol(format!("invalid HTTP version '{}'", s)))?;

        Ok(Version {
            major: major
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid HTTP version '{}'", s)))?,
            minor: minor
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid HTTP version '{}'", s)))?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_methods() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("PATCH".parse::<Method>().unwrap(), Method::Patch);
        assert_eq!("BREW".parse::<Method>().unwrap(), Method::Unknown);
    }

    #[test]
    fn parse_versions() {
        assert_eq!(Version::parse("HTTP/1.1").unwrap(), Version::V1_1);
        assert_eq!(Version::parse("HTTP/1.0").unwrap(), Version::V1_0);
        assert!(Version::V1_0 < Version::V1_1);
        assert!(Version::parse("HTTPS/1.1").is_err());
        assert!(Version::parse("HTTP/1").is_err());
    }

    #[test]
    fn status_reasons() {
        assert_eq!(status::reason(200), "OK");
        assert_eq!(status::reason(404), "Not Found");
        assert_eq!(status::reason(599), "Unknown");
    }
}
