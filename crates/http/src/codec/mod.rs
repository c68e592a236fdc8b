//! Wire codecs that frame streams onto one network connection
//!
//! A codec translates between the bytes of a [`Connection`] and the per-stream events of
//! [`crate::protocol`]. The upper layer never learns which protocol is in use: a client
//! asks a [`ClientCodec`] for a new stream and gets a [`StreamEncoder`] back, a server
//! codec asks its [`ServerConnectionCallbacks`] for a [`StreamDecoder`] whenever the peer
//! opens a stream.
//!
//! - [`http1`]: HTTP/1.1, one stream at a time, pipelined requests answered in order
//! - [`http2`]: prior-knowledge HTTP/2 with many concurrent streams
//!
//! Codecs hold their connection weakly and write to it directly. Once the connection is
//! closed they deliver nothing more.
//!
//! [`Connection`]: micro_proxy_net::network::Connection

pub mod http1;
pub mod http2;

mod settings;

use std::rc::{Rc, Weak};

use bytes::BytesMut;
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::{Connection, ConnectionState};

pub use settings::CodecSettings;
pub use settings::Http1Settings;
pub use settings::Http2Settings;

use crate::protocol::{CodecError, Protocol, StreamDecoder, StreamEncoder};

/// Which codec a client or server filter builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    Http1,
    Http2,
}

impl CodecType {
    pub fn protocol(self) -> Protocol {
        match self {
            CodecType::Http1 => Protocol::Http11,
            CodecType::Http2 => Protocol::Http2,
        }
    }
}

pub trait CodecConnection {
    /// Consumes as much of `data` as forms complete protocol units and delivers them to
    /// the streams. An error means the connection must be aborted.
    fn dispatch(&self, data: &mut Buffer) -> Result<(), CodecError>;

    fn protocol(&self) -> Protocol;

    /// Tells the peer no new streams will be accepted. A no-op on HTTP/1.1.
    fn go_away(&self);

    /// The transport closed: finishes a body delimited by the close, then resets every
    /// stream still open with `ConnectionTermination`.
    fn on_transport_close(&self);
}

pub trait ClientCodec: CodecConnection {
    /// Opens a stream whose response events go to `response_decoder`.
    fn new_stream(&self, response_decoder: Rc<dyn StreamDecoder>) -> Rc<dyn StreamEncoder>;
}

pub trait ServerCodec: CodecConnection {}

pub trait ServerConnectionCallbacks {
    /// The peer opened a stream; `response_encoder` answers it and the returned decoder
    /// receives its request events.
    fn new_stream(&self, response_encoder: Rc<dyn StreamEncoder>) -> Rc<dyn StreamDecoder>;
}

/// Writes encoded bytes to the connection, failing once it is closed.
pub(crate) fn write_to(connection: &Weak<dyn Connection>, bytes: BytesMut) -> Result<(), CodecError> {
    let Some(connection) = connection.upgrade().filter(|c| c.state() != ConnectionState::Closed) else {
        return Err(CodecError::ConnectionClosed);
    };
    if !bytes.is_empty() {
        connection.write(&mut Buffer::from(bytes));
    }
    Ok(())
}

pub(crate) fn connection_closed(connection: &Weak<dyn Connection>) -> bool {
    connection.upgrade().is_none_or(|c| c.state() == ConnectionState::Closed)
}
