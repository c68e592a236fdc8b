//! HTTP codecs for micro-proxy
//!
//! This crate frames HTTP streams onto the connections of `micro_proxy_net`. A codec owns
//! the wire format of one connection and speaks to the layer above only through
//! per-stream capabilities, so a proxy can bridge HTTP/1.1 and HTTP/2 streams without
//! knowing which protocol each side uses.
//!
//! # Architecture
//!
//! - [`protocol`]: headers, stream traits, message items and error types
//! - [`codec`]: the HTTP/1.1 and HTTP/2 client and server codecs
//! - [`codec_client`]: an upstream connection plus a client codec, tracking active requests
//! - [`server`]: a read filter that serves HTTP on accepted connections
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use http::Method;
//! use micro_proxy_http::codec::{CodecSettings, CodecType};
//! use micro_proxy_http::codec_client::CodecClient;
//! use micro_proxy_http::protocol::{Headers, StreamDecoder};
//! use micro_proxy_net::event::{Dispatcher, RunType};
//! use micro_proxy_net::stats::NullStatsSink;
//!
//! # fn decoder() -> Rc<dyn StreamDecoder> { unimplemented!() }
//! let dispatcher = Dispatcher::new().expect("runtime should build");
//! let connection = dispatcher.create_client_connection("tcp://127.0.0.1:8080").expect("valid url");
//! let client = CodecClient::new(CodecType::Http1, connection, Rc::new(NullStatsSink), CodecSettings::default());
//!
//! let encoder = client.new_stream(decoder());
//! encoder.encode_headers(&Headers::request(Method::GET, "/status", "localhost"), true).expect("request head");
//! dispatcher.run(RunType::Block);
//! ```
//!
//! # Threading
//!
//! Codecs live on the thread of the dispatcher that owns their connection. They are
//! `Rc`-based and hold the connection weakly; once it closes, open streams are reset
//! with [`protocol::StreamResetReason::ConnectionTermination`].

pub mod codec;
pub mod codec_client;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;
