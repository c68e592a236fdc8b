use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use http::HeaderMap;
use micro_proxy_net::buffer::Buffer;

use crate::protocol::{CodecError, Headers, StreamFault};

/// Why a stream ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamResetReason {
    /// Reset by this side.
    LocalReset,
    /// Reset by the peer.
    RemoteReset,
    /// The connection carrying the stream went away.
    ConnectionTermination,
    /// A buffer or frame limit was exceeded.
    Overflow,
    /// The connection carrying the stream was never established.
    ConnectionFailure,
}

impl fmt::Display for StreamResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StreamResetReason::LocalReset => "local reset",
            StreamResetReason::RemoteReset => "remote reset",
            StreamResetReason::ConnectionTermination => "connection termination",
            StreamResetReason::Overflow => "overflow",
            StreamResetReason::ConnectionFailure => "connection failure",
        };
        f.write_str(reason)
    }
}

/// Which wire protocol a codec speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http11,
    Http2,
}

pub trait StreamCallbacks {
    /// Called exactly once per stream; nothing is decoded or encoded on it afterwards.
    fn on_reset_stream(&self, reason: StreamResetReason);
}

/// One request/response exchange on a codec.
pub trait Stream {
    fn add_callbacks(&self, callbacks: Weak<dyn StreamCallbacks>);

    /// Resets the stream locally. On HTTP/1.1 this closes the whole connection.
    fn reset_stream(&self, reason: StreamResetReason);
}

/// Receives the decoded events of one stream.
///
/// Exactly one call carries `end_stream = true`, or is `decode_trailers`; nothing follows
/// it. An error makes the codec abort the connection.
pub trait StreamDecoder {
    fn decode_headers(&self, headers: Headers, end_stream: bool) -> Result<(), StreamFault>;

    fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), StreamFault>;

    /// Trailers always end the stream.
    fn decode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamFault>;
}

/// Frames the outbound half of one stream.
pub trait StreamEncoder {
    fn encode_headers(&self, headers: &Headers, end_stream: bool) -> Result<(), CodecError>;

    /// Consumes `data`.
    fn encode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), CodecError>;

    /// Ends the stream with trailer fields.
    fn encode_trailers(&self, trailers: &HeaderMap) -> Result<(), CodecError>;

    fn stream(&self) -> Rc<dyn Stream>;
}

/// Keeps the reset callbacks of a stream and runs them at most once.
#[derive(Default)]
pub(crate) struct StreamCallbackHelper {
    callbacks: RefCell<Vec<Weak<dyn StreamCallbacks>>>,
    reset: Cell<bool>,
}

impl StreamCallbackHelper {
    pub(crate) fn add_callbacks(&self, callbacks: Weak<dyn StreamCallbacks>) {
        self.callbacks.borrow_mut().push(callbacks);
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.get()
    }

    /// Returns false if the stream was already reset.
    pub(crate) fn run_reset_callbacks(&self, reason: StreamResetReason) -> bool {
        if self.reset.replace(true) {
            return false;
        }
        let callbacks: Vec<_> = self.callbacks.borrow().iter().filter_map(Weak::upgrade).collect();
        for callback in callbacks {
            callback.on_reset_stream(reason);
        }
        true
    }
}

impl fmt::Debug for StreamCallbackHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbackHelper")
            .field("callbacks", &self.callbacks.borrow().len())
            .field("reset", &self.reset.get())
            .finish()
    }
}
