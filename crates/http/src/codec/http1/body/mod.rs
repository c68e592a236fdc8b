//! HTTP/1.1 payload framing
//!
//! [`PayloadDecoder`] and [`PayloadEncoder`] pick a strategy from a
//! [`PayloadSize`](crate::protocol::PayloadSize): `content-length`, chunked transfer
//! coding (with trailers), a body read until the connection closes, or no body.

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
