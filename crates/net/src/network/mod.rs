//! Connections, filter chains, listeners and name resolution
//!
//! Every type here is bound to one [`Dispatcher`](crate::event::Dispatcher) and is used
//! only from its thread. Capabilities are expressed as traits so that production types
//! ([`ConnectionImpl`], [`ListenerImpl`], [`DnsResolverImpl`]) and the test doubles in
//! [`crate::mocks`] can stand in for each other.
//!
//! # Ordering
//!
//! - read filters see inbound bytes in installation order
//! - write filters see outbound bytes in reverse installation order
//! - connection observers hear each event in registration order
//! - once a connection is closed nothing reaches its filters or observers again

mod address;
mod connection;
mod connection_impl;
mod dns;
mod drain_decision;
mod filter;
mod filter_manager;
mod listener;

pub use address::parse_tcp_url;
pub use connection::ClientConnection;
pub use connection::Connection;
pub use connection::ConnectionBufferType;
pub use connection::ConnectionCallbacks;
pub use connection::ConnectionCloseType;
pub use connection::ConnectionEvent;
pub use connection::ConnectionPtr;
pub use connection::ConnectionState;
pub use connection_impl::ConnectionImpl;
pub use dns::DnsResolver;
pub use dns::DnsResolverImpl;
pub use dns::ResolveCb;
pub use drain_decision::DrainDecision;
pub use filter::Filter;
pub use filter::FilterChainFactory;
pub use filter::FilterStatus;
pub use filter::ReadFilter;
pub use filter::ReadFilterCallbacks;
pub use filter::WriteFilter;
pub use listener::ListenSocket;
pub use listener::Listener;
pub use listener::ListenerCallbacks;
pub use listener::ListenerImpl;
pub use listener::TcpListenSocket;
