//! HTTP/1.1 codec
//!
//! The wire side is a set of tokio-util [`Decoder`](tokio_util::codec::Decoder) and
//! [`Encoder`](tokio_util::codec::Encoder) state machines:
//!
//! - [`header`]: request and response head decoders built on `httparse`, and the head encoder
//! - [`body`]: payload decoders and encoders for `content-length`, chunked and close-delimited bodies
//! - [`MessageDecoder`]: a head followed by its payload, message after message
//!
//! [`Http1ClientCodec`] and [`Http1ServerCodec`] drive those machines against a
//! connection and turn the decoded items into stream events. Body bytes decoded within
//! one dispatch are coalesced into a single `decode_data` call.

pub mod body;
pub mod header;

mod client;
mod message_decoder;
mod server;
mod stream;

pub use client::Http1ClientCodec;
pub use message_decoder::MessageDecoder;
pub use server::Http1ServerCodec;
