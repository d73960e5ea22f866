use std::path::PathBuf;

use serde::Deserialize;

/// Server configuration values, deserializable from any serde format.
///
/// The certificate paths are carried for the embedding application, which
/// builds the `rustls::ServerConfig` handed to
/// [`Server::set_tls_config`].
///
/// [`Server::set_tls_config`]: crate::http::Server::set_tls_config
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerOptions {
    /// Client address ranges allowed to connect; overrides `deny`.
    /// The pattern `0/0` matches all addresses.
    pub allow: String,
    /// Client address ranges refused a connection.
    pub deny: String,
    /// Seconds before an idle client connection times out.
    pub connection_timeout: Option<u64>,
    /// Size of the listen backlog queue.
    pub connection_backlog: i32,
    /// Maximum simultaneous client connections.
    pub max_connections: Option<usize>,
    /// Maximum client connection lifetime in seconds.
    pub max_ttl: Option<u64>,
    pub http_max_body_size: Option<usize>,
    pub http_max_headers_size: Option<usize>,
    /// Space-separated `address[:port]` list for plain HTTP.
    pub http_addresses: String,
    /// Space-separated `address[:port]` list for HTTPS.
    pub https_addresses: String,
    pub certificate_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
    pub crl_file: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            allow: "0/0".to_string(),
            deny: String::new(),
            connection_timeout: None,
            connection_backlog: 128,
            max_connections: None,
            max_ttl: None,
            http_max_body_size: None,
            http_max_headers_size: None,
            http_addresses: String::new(),
            https_addresses: String::new(),
            certificate_file: None,
            private_key_file: None,
            crl_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ServerOptions::default();
        assert_eq!(opts.allow, "0/0");
        assert_eq!(opts.connection_backlog, 128);
        assert!(opts.max_connections.is_none());
    }
}
