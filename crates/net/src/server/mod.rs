//! Ownership of listeners and the connections they accept.

mod connection_handler;

pub use connection_handler::ConnectionHandler;
