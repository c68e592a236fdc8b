use std::rc::{Rc, Weak};

use crate::buffer::Buffer;
use crate::event::Dispatcher;
use crate::network::{Filter, ReadFilter, WriteFilter};
use crate::ssl::SslConnection;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Open,
    /// A `FlushWrite` close is draining the write buffer.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseType {
    /// Flush pending writes, then close.
    FlushWrite,
    /// Close now and discard pending writes.
    NoFlush,
}

/// Lifecycle notifications delivered to [`ConnectionCallbacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    RemoteClose,
    LocalClose,
}

impl ConnectionEvent {
    pub fn is_close(self) -> bool {
        matches!(self, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionBufferType {
    Read,
    Write,
}

/// Observer of a connection's buffers and lifecycle.
pub trait ConnectionCallbacks {
    /// `old_size` is the size at the previous report; `delta` is the signed change since.
    fn on_buffer_change(&self, buffer_type: ConnectionBufferType, old_size: u64, delta: i64);

    fn on_event(&self, event: ConnectionEvent);
}

/// One transport connection and its filter chain.
///
/// All methods take `&self`: filters and observers call back into the connection while
/// it is dispatching to them.
pub trait Connection {
    /// Observers are held weakly; a dropped observer is skipped.
    fn add_connection_callbacks(&self, callbacks: Weak<dyn ConnectionCallbacks>);

    fn add_write_filter(&self, filter: Rc<dyn WriteFilter>);

    /// Adds a filter to both the read and the write chain.
    fn add_filter(&self, filter: Rc<dyn Filter>);

    fn add_read_filter(&self, filter: Rc<dyn ReadFilter>);

    /// Idempotent once the connection is closed.
    fn close(&self, close_type: ConnectionCloseType);

    fn dispatcher(&self) -> Dispatcher;

    fn id(&self) -> u64;

    /// The protocol negotiated by the TLS layer, empty without one.
    fn next_protocol(&self) -> String;

    fn no_delay(&self, enable: bool);

    /// Stops (or resumes) reading from the socket.
    fn read_disable(&self, disable: bool);

    fn read_enabled(&self) -> bool;

    fn remote_address(&self) -> String;

    fn ssl(&self) -> Option<Rc<dyn SslConnection>>;

    fn state(&self) -> ConnectionState;

    /// Runs `data` through the write filters and queues it, leaving `data` empty.
    fn write(&self, data: &mut Buffer);
}

/// An outbound connection that has to be explicitly started.
pub trait ClientConnection: Connection {
    fn connect(&self);
}

pub type ConnectionPtr = Rc<dyn Connection>;
