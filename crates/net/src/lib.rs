//! The connection and filter-chain engine of micro-proxy
//!
//! This crate moves bytes between sockets and protocol filters on a single-threaded
//! event loop. Everything bound to one [`event::Dispatcher`] runs on the dispatcher's
//! thread, so the types here use `Rc`, `Cell` and `RefCell` instead of locks.
//!
//! # Architecture
//!
//! - [`buffer`]: byte queues with watermark change tracking
//! - [`event`]: the dispatcher, its timers and cross-thread posting
//! - [`network`]: connections, filter chains, listeners and the DNS resolver
//! - [`server`]: the connection handler that owns listeners and accepted connections
//! - [`stats`], [`ssl`], [`upstream`]: capabilities consumed from outside the engine
//!
//! # Data flow
//!
//! A listener accepts a socket and wraps it in a [`network::ConnectionImpl`]. The
//! [`network::FilterChainFactory`] installs read and write filters. Inbound bytes run
//! through the read filters in installation order; outbound bytes run through the
//! write filters in reverse order before they reach the connection's write buffer.
//!
//! # Example
//!
//! ```no_run
//! use micro_proxy_net::buffer::Buffer;
//! use micro_proxy_net::event::{Dispatcher, RunType};
//! use micro_proxy_net::network::{ClientConnection, Connection};
//!
//! let dispatcher = Dispatcher::new().expect("runtime should build");
//! let connection = dispatcher.create_client_connection("tcp://127.0.0.1:8080").expect("valid url");
//! connection.connect();
//! connection.write(&mut Buffer::from("PING\r\n"));
//! dispatcher.run(RunType::Block);
//! ```

pub mod buffer;
pub mod event;
pub mod network;
pub mod server;
pub mod ssl;
pub mod stats;
pub mod upstream;

mod config;
pub use config::ConnectionConfig;

mod error;
pub use error::NetworkError;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

mod utils;
pub(crate) use utils::ensure;
