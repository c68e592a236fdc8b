//! Protocol-independent HTTP types
//!
//! - [`Headers`]: a header block with typed pseudo fields
//! - [`Stream`], [`StreamDecoder`], [`StreamEncoder`], [`StreamCallbacks`]: the per-stream
//!   capabilities a codec hands out and consumes
//! - [`Message`], [`PayloadItem`], [`PayloadSize`]: the items of the HTTP/1.1 state machines
//! - error types: [`CodecError`] at the top, [`ParseError`] and [`SendError`] for the
//!   HTTP/1.1 wire, [`StreamFault`] for decoders refusing a call

mod error;
mod headers;
mod message;
mod stream;

pub use error::CodecError;
pub use error::ParseError;
pub use error::SendError;
pub use error::StreamFault;
pub use headers::Headers;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;
pub use stream::Protocol;
pub use stream::Stream;
pub use stream::StreamCallbacks;
pub use stream::StreamDecoder;
pub use stream::StreamEncoder;
pub use stream::StreamResetReason;
pub(crate) use stream::StreamCallbackHelper;
