//! The TLS capability a connection can carry.

/// Opaque TLS state attached to a connection.
///
/// The handshake is done elsewhere. The engine reads only the negotiated protocol.
pub trait SslConnection {
    /// The ALPN protocol, empty if none was negotiated.
    fn next_protocol(&self) -> String;

    fn sha256_peer_certificate_digest(&self) -> String;
}
