use std::net::SocketAddr;

use crate::{NetworkError, ensure};

const TCP_SCHEME: &str = "tcp://";

/// Parses the `tcp://<ip>:<port>` form used to address connections.
///
/// The host must be an IP literal (IPv6 in brackets); names go through a
/// [`DnsResolver`](super::DnsResolver) first.
pub fn parse_tcp_url(url: &str) -> Result<SocketAddr, NetworkError> {
    ensure!(url.starts_with(TCP_SCHEME), NetworkError::invalid_address(url, "expected tcp:// scheme"));

    let authority = &url[TCP_SCHEME.len()..];
    ensure!(!authority.is_empty(), NetworkError::invalid_address(url, "missing host and port"));

    authority.parse::<SocketAddr>().map_err(|e| NetworkError::invalid_address(url, e))
}
