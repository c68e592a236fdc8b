//! Prior-knowledge HTTP/2 (h2c)
//!
//! The layers, bottom up:
//!
//! - [`frame`]: the 9-byte frame header and the payload of every frame type, as a
//!   tokio-util codec
//! - [`hpack`] and its Huffman code: header compression (RFC 7541)
//! - [`Session`]: a sans-IO connection state machine handling the preface, SETTINGS,
//!   stream states and flow control
//! - [`Http2ClientCodec`] and [`Http2ServerCodec`]: bind a session to a network
//!   connection and to the protocol-independent stream traits
//!
//! Many streams share one connection. A fault on one stream resets that stream alone;
//! connection errors are answered with GOAWAY and fail the dispatch.

mod client;
mod error;
mod flow_control;
pub mod frame;
mod headers;
pub mod hpack;
mod huffman;
mod server;
mod session;
mod settings;
mod stream;

pub use client::Http2ClientCodec;
pub use error::ErrorCode;
pub use error::Http2Error;
pub use frame::Frame;
pub use frame::FrameCodec;
pub use server::Http2ServerCodec;
pub use session::Event;
pub use session::PREFACE;
pub use session::Role;
pub use session::Session;
pub use settings::SettingsParams;

/// Largest flow control window, `2^31 - 1`.
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

pub(crate) const MAX_STREAM_ID: u32 = 0x7fff_ffff;
