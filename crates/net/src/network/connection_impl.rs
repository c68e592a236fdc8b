//! The TCP [`Connection`] used for both accepted and outbound connections.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::filter_manager::FilterManager;
use crate::buffer::{Buffer, WatermarkBuffer};
use crate::event::{ActiveSource, Dispatcher};
use crate::network::{
    ClientConnection, Connection, ConnectionBufferType, ConnectionCallbacks, ConnectionCloseType, ConnectionEvent,
    ConnectionState, Filter, FilterStatus, ReadFilter, WriteFilter, parse_tcp_url,
};
use crate::ssl::SslConnection;
use crate::{ConnectionConfig, NetworkError};

mod registry {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

    /// Process-wide unique, monotonically increasing
    pub(super) fn next_connection_id() -> u64 {
        NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
    }
}

/// A connection over a non-blocking TCP socket, driven by its dispatcher.
///
/// Server-side instances wrap an accepted socket and are open from the start. Client
/// instances are created unconnected; [`ClientConnection::connect`] starts the connect and
/// raises [`ConnectionEvent::Connected`] or [`ConnectionEvent::RemoteClose`] when it
/// resolves. Writes made before that are buffered and flushed once the socket is up.
pub struct ConnectionImpl {
    id: u64,
    self_ref: Weak<ConnectionImpl>,
    dispatcher: Dispatcher,
    config: ConnectionConfig,
    remote_address: String,
    connect_address: Option<SocketAddr>,

    socket: RefCell<Option<Rc<TcpStream>>>,
    // the I/O task, or the pending connect before the socket exists
    io_task: RefCell<Option<JoinHandle<()>>>,
    io_wakeup: Rc<Notify>,

    state: Cell<ConnectionState>,
    read_enabled: Cell<bool>,
    connecting: Cell<bool>,
    no_delay: Cell<bool>,

    read_buffer: RefCell<WatermarkBuffer>,
    write_buffer: RefCell<WatermarkBuffer>,
    filter_manager: FilterManager,
    callbacks: RefCell<Vec<Weak<dyn ConnectionCallbacks>>>,
    ssl: RefCell<Option<Rc<dyn SslConnection>>>,
}

impl ConnectionImpl {
    /// Wraps a socket returned by a listener.
    pub(crate) fn new_server(
        dispatcher: &Dispatcher,
        stream: TcpStream,
        remote: SocketAddr,
        config: ConnectionConfig,
    ) -> Rc<Self> {
        let connection = Self::build(dispatcher, remote.ip().to_string(), None, config);
        connection.apply_no_delay(&stream);
        connection.attach_socket(stream);
        debug!(connection_id = connection.id, remote = %remote, "new server connection");
        connection
    }

    /// Creates an unconnected client connection to a `tcp://ip:port` url.
    pub(crate) fn new_client(
        dispatcher: &Dispatcher,
        url: &str,
        config: ConnectionConfig,
    ) -> Result<Rc<Self>, NetworkError> {
        let address = parse_tcp_url(url)?;
        let connection = Self::build(dispatcher, address.ip().to_string(), Some(address), config);
        debug!(connection_id = connection.id, %address, "new client connection");
        Ok(connection)
    }

    fn build(
        dispatcher: &Dispatcher,
        remote_address: String,
        connect_address: Option<SocketAddr>,
        config: ConnectionConfig,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            id: registry::next_connection_id(),
            self_ref: self_ref.clone(),
            dispatcher: dispatcher.clone(),
            config,
            remote_address,
            connect_address,
            socket: RefCell::new(None),
            io_task: RefCell::new(None),
            io_wakeup: Rc::new(Notify::new()),
            state: Cell::new(ConnectionState::Open),
            read_enabled: Cell::new(true),
            connecting: Cell::new(false),
            no_delay: Cell::new(config.no_delay()),
            read_buffer: RefCell::new(WatermarkBuffer::new(ConnectionBufferType::Read, config.read_watermarks())),
            write_buffer: RefCell::new(WatermarkBuffer::new(ConnectionBufferType::Write, config.write_watermarks())),
            filter_manager: FilterManager::default(),
            callbacks: RefCell::new(Vec::new()),
            ssl: RefCell::new(None),
        })
    }

    /// Attaches the TLS state of this connection, reported by [`Connection::ssl`].
    pub fn attach_ssl(&self, ssl: Rc<dyn SslConnection>) {
        *self.ssl.borrow_mut() = Some(ssl);
    }

    /// Bytes received and not yet consumed by the read filters.
    pub fn read_buffer_len(&self) -> usize {
        self.read_buffer.borrow().len()
    }

    /// Bytes queued and not yet written to the socket.
    pub fn write_buffer_len(&self) -> usize {
        self.write_buffer.borrow().len()
    }

    pub(crate) fn filter_manager(&self) -> &FilterManager {
        &self.filter_manager
    }

    pub(crate) fn take_read_buffer(&self) -> Buffer {
        self.read_buffer.borrow_mut().take()
    }

    pub(crate) fn restore_read_buffer(&self, buffer: Buffer) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        self.read_buffer.borrow_mut().restore(buffer);
        self.raise_buffer_change(ConnectionBufferType::Read);
    }

    fn attach_socket(&self, stream: TcpStream) {
        let socket = Rc::new(stream);
        *self.socket.borrow_mut() = Some(Rc::clone(&socket));
        let task = self.dispatcher.spawn_local(run_io(
            self.self_ref.clone(),
            socket,
            Rc::clone(&self.io_wakeup),
            self.dispatcher.active_source(),
        ));
        *self.io_task.borrow_mut() = Some(task);
    }

    fn apply_no_delay(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.no_delay.get()) {
            warn!(connection_id = self.id, cause = %e, "failed to set TCP_NODELAY");
        }
    }

    fn interest(&self) -> Option<Interest> {
        let read = self.read_enabled.get() && self.state.get() == ConnectionState::Open;
        let write = !self.write_buffer.borrow().is_empty();
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn on_file_event(self: &Rc<Self>, socket: &TcpStream, ready: Ready) {
        if ready.is_writable() || ready.is_write_closed() {
            self.on_write_ready(socket);
        }
        if self.state.get() == ConnectionState::Closed || !self.read_enabled.get() {
            return;
        }
        if ready.is_readable() || ready.is_read_closed() {
            self.on_read_ready(socket);
        }
    }

    fn on_read_ready(self: &Rc<Self>, socket: &TcpStream) {
        let mut bytes_read = 0usize;
        let mut end_of_stream = false;
        loop {
            let result = {
                let mut read_buffer = self.read_buffer.borrow_mut();
                let bytes = read_buffer.buffer_mut().bytes_mut();
                bytes.reserve(self.config.read_chunk_size());
                socket.try_read_buf(bytes)
            };
            match result {
                Ok(0) => {
                    end_of_stream = true;
                    break;
                }
                Ok(n) => bytes_read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(connection_id = self.id, cause = %e, "read error");
                    self.close_socket(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        trace!(connection_id = self.id, bytes_read, end_of_stream, "read ready");
        if bytes_read > 0 {
            self.raise_buffer_change(ConnectionBufferType::Read);
            self.filter_manager.on_read(self);
        }

        if end_of_stream && self.state.get() != ConnectionState::Closed {
            debug!(connection_id = self.id, "remote close");
            self.close_socket(ConnectionEvent::RemoteClose);
        }
    }

    fn on_write_ready(&self, socket: &TcpStream) {
        loop {
            let result = {
                let write_buffer = self.write_buffer.borrow();
                if write_buffer.is_empty() {
                    break;
                }
                socket.try_write(write_buffer.buffer().as_slice())
            };
            match result {
                Ok(0) => break,
                Ok(n) => {
                    trace!(connection_id = self.id, written = n, "wrote to socket");
                    self.write_buffer.borrow_mut().buffer_mut().drain(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(connection_id = self.id, cause = %e, "write error");
                    self.close_socket(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        self.raise_buffer_change(ConnectionBufferType::Write);
        if self.state.get() == ConnectionState::Closing && self.write_buffer.borrow().is_empty() {
            debug!(connection_id = self.id, "write buffer flushed, closing");
            self.close_socket(ConnectionEvent::LocalClose);
        }
    }

    fn on_connect_complete(&self, result: io::Result<TcpStream>) {
        self.connecting.set(false);
        self.io_task.borrow_mut().take();
        if self.state.get() == ConnectionState::Closed {
            return;
        }

        match result {
            Ok(stream) => {
                debug!(connection_id = self.id, "connected");
                self.apply_no_delay(&stream);
                self.attach_socket(stream);
                self.raise_event(ConnectionEvent::Connected);
            }
            Err(e) => {
                debug!(connection_id = self.id, cause = %e, "connect failed");
                self.close_socket(ConnectionEvent::RemoteClose);
            }
        }
    }

    fn close_socket(&self, event: ConnectionEvent) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        debug!(connection_id = self.id, ?event, "closing socket");

        self.state.set(ConnectionState::Closed);
        self.connecting.set(false);
        if let Some(task) = self.io_task.borrow_mut().take() {
            task.abort();
        }
        self.socket.borrow_mut().take();
        self.read_buffer.borrow_mut().reset();
        self.write_buffer.borrow_mut().reset();

        self.raise_event(event);
    }

    fn snapshot_callbacks(&self) -> Vec<Rc<dyn ConnectionCallbacks>> {
        self.callbacks.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    fn raise_event(&self, event: ConnectionEvent) {
        trace!(connection_id = self.id, ?event, "raising connection event");
        for callbacks in self.snapshot_callbacks() {
            // a close raised from an earlier observer supersedes this event
            if !event.is_close() && self.state.get() == ConnectionState::Closed {
                return;
            }
            callbacks.on_event(event);
        }
    }

    fn raise_buffer_change(&self, buffer_type: ConnectionBufferType) {
        let change = match buffer_type {
            ConnectionBufferType::Read => self.read_buffer.borrow_mut().take_change(),
            ConnectionBufferType::Write => self.write_buffer.borrow_mut().take_change(),
        };
        let Some(change) = change else {
            return;
        };

        for callbacks in self.snapshot_callbacks() {
            if self.state.get() == ConnectionState::Closed {
                return;
            }
            callbacks.on_buffer_change(change.kind, change.old_size, change.delta);
        }
    }
}

async fn run_io(connection: Weak<ConnectionImpl>, socket: Rc<TcpStream>, wakeup: Rc<Notify>, source: ActiveSource) {
    let _source = source;
    loop {
        let interest = match connection.upgrade() {
            Some(connection) if connection.state() != ConnectionState::Closed => connection.interest(),
            _ => return,
        };

        let ready = match interest {
            Some(interest) => tokio::select! {
                ready = socket.ready(interest) => Some(ready),
                _ = wakeup.notified() => None,
            },
            None => {
                wakeup.notified().await;
                None
            }
        };

        let Some(connection) = connection.upgrade() else {
            return;
        };
        match ready {
            Some(Ok(ready)) => connection.on_file_event(&socket, ready),
            Some(Err(e)) => {
                debug!(connection_id = connection.id, cause = %e, "socket readiness error");
                connection.close_socket(ConnectionEvent::RemoteClose);
            }
            // interest changed, recompute it
            None => {}
        }
    }
}

impl Connection for ConnectionImpl {
    fn add_connection_callbacks(&self, callbacks: Weak<dyn ConnectionCallbacks>) {
        self.callbacks.borrow_mut().push(callbacks);
    }

    fn add_write_filter(&self, filter: Rc<dyn WriteFilter>) {
        self.filter_manager.add_write_filter(filter);
    }

    fn add_filter(&self, filter: Rc<dyn Filter>) {
        let read: Rc<dyn ReadFilter> = filter.clone();
        let write: Rc<dyn WriteFilter> = filter;
        self.add_read_filter(read);
        self.add_write_filter(write);
    }

    fn add_read_filter(&self, filter: Rc<dyn ReadFilter>) {
        self.filter_manager.add_read_filter(self.self_ref.clone(), filter);
    }

    fn close(&self, close_type: ConnectionCloseType) {
        match self.state.get() {
            ConnectionState::Closed => return,
            ConnectionState::Closing => {
                if close_type == ConnectionCloseType::NoFlush {
                    self.close_socket(ConnectionEvent::LocalClose);
                }
                return;
            }
            ConnectionState::Open => {}
        }

        let has_transport = self.socket.borrow().is_some() || self.connecting.get();
        let pending = !self.write_buffer.borrow().is_empty();
        if close_type == ConnectionCloseType::FlushWrite && pending && has_transport {
            debug!(connection_id = self.id, pending = self.write_buffer_len(), "closing after flush");
            self.state.set(ConnectionState::Closing);
            self.io_wakeup.notify_one();
        } else {
            self.close_socket(ConnectionEvent::LocalClose);
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn next_protocol(&self) -> String {
        self.ssl.borrow().as_ref().map(|ssl| ssl.next_protocol()).unwrap_or_default()
    }

    fn no_delay(&self, enable: bool) {
        self.no_delay.set(enable);
        if let Some(socket) = self.socket.borrow().as_ref() {
            self.apply_no_delay(socket);
        }
    }

    fn read_disable(&self, disable: bool) {
        if self.state.get() != ConnectionState::Open {
            return;
        }
        let enable = !disable;
        if self.read_enabled.replace(enable) == enable {
            return;
        }
        trace!(connection_id = self.id, enable, "read enable changed");
        self.io_wakeup.notify_one();

        if enable && !self.read_buffer.borrow().is_empty() {
            // bytes held back while disabled go through the filters again
            let weak = self.self_ref.clone();
            self.dispatcher.post(move || {
                if let Some(connection) = weak.upgrade()
                    && connection.read_enabled.get()
                {
                    connection.filter_manager.on_read(&connection);
                }
            });
        }
    }

    fn read_enabled(&self) -> bool {
        self.read_enabled.get()
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn ssl(&self) -> Option<Rc<dyn SslConnection>> {
        self.ssl.borrow().clone()
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn write(&self, data: &mut Buffer) {
        if self.state.get() != ConnectionState::Open {
            debug!(connection_id = self.id, state = ?self.state.get(), "dropping write on a connection that is not open");
            data.clear();
            return;
        }
        if self.filter_manager.on_write(data) == FilterStatus::StopIteration || data.is_empty() {
            return;
        }

        trace!(connection_id = self.id, len = data.len(), "queueing write");
        self.write_buffer.borrow_mut().buffer_mut().move_from(data);
        self.raise_buffer_change(ConnectionBufferType::Write);
        self.io_wakeup.notify_one();
    }
}

impl ClientConnection for ConnectionImpl {
    fn connect(&self) {
        let Some(address) = self.connect_address else {
            warn!(connection_id = self.id, "connect called on an accepted connection");
            return;
        };
        if self.state.get() != ConnectionState::Open || self.connecting.get() || self.socket.borrow().is_some() {
            return;
        }

        debug!(connection_id = self.id, %address, "connecting");
        self.connecting.set(true);
        let weak = self.self_ref.clone();
        let source = self.dispatcher.active_source();
        let task = self.dispatcher.spawn_local(async move {
            let _source = source;
            let result = TcpStream::connect(address).await;
            if let Some(connection) = weak.upgrade() {
                connection.on_connect_complete(result);
            }
        });
        *self.io_task.borrow_mut() = Some(task);
    }
}

impl Drop for ConnectionImpl {
    fn drop(&mut self) {
        if self.state.get() != ConnectionState::Closed {
            debug!(connection_id = self.id, "connection dropped while open");
            if let Some(task) = self.io_task.get_mut().take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionImpl")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("state", &self.state.get())
            .field("read_enabled", &self.read_enabled.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::predicate::eq;

    use super::*;
    use crate::event::RunType;
    use crate::mocks::MockConnectionCallbacks;
    use crate::network::{ConnectionPtr, ListenSocket, ListenerCallbacks, ListenerImpl, ReadFilterCallbacks, TcpListenSocket};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).with_test_writer().try_init();
    }

    #[derive(Default)]
    struct EchoServer {
        connections: RefCell<Vec<ConnectionPtr>>,
    }

    impl ListenerCallbacks for EchoServer {
        fn on_new_connection(&self, connection: ConnectionPtr) {
            connection.add_read_filter(Rc::new(Echo::default()));
            self.connections.borrow_mut().push(connection);
        }
    }

    #[derive(Default)]
    struct Echo {
        callbacks: RefCell<Option<Rc<dyn ReadFilterCallbacks>>>,
    }

    impl ReadFilter for Echo {
        fn on_data(&self, data: &mut Buffer) -> FilterStatus {
            if let Some(callbacks) = self.callbacks.borrow().as_ref() {
                callbacks.connection().write(data);
            }
            FilterStatus::StopIteration
        }

        fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>) {
            *self.callbacks.borrow_mut() = Some(callbacks);
        }
    }

    /// Logs every call into a shared trace and passes data on untouched.
    struct Recording {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl ReadFilter for Recording {
        fn on_data(&self, _data: &mut Buffer) -> FilterStatus {
            self.log.borrow_mut().push(format!("read:{}", self.name));
            FilterStatus::Continue
        }

        fn initialize_read_filter_callbacks(&self, _callbacks: Rc<dyn ReadFilterCallbacks>) {}
    }

    impl WriteFilter for Recording {
        fn on_write(&self, _data: &mut Buffer) -> FilterStatus {
            self.log.borrow_mut().push(format!("write:{}", self.name));
            FilterStatus::Continue
        }
    }

    /// Consumes everything and stops the loop once `expected` bytes arrived.
    struct Collect {
        dispatcher: Dispatcher,
        received: RefCell<Vec<u8>>,
        expected: usize,
    }

    impl ReadFilter for Collect {
        fn on_data(&self, data: &mut Buffer) -> FilterStatus {
            self.received.borrow_mut().extend_from_slice(data.as_slice());
            data.clear();
            if self.received.borrow().len() >= self.expected {
                self.dispatcher.exit();
            }
            FilterStatus::StopIteration
        }

        fn initialize_read_filter_callbacks(&self, _callbacks: Rc<dyn ReadFilterCallbacks>) {}
    }

    #[derive(Default)]
    struct EventLog {
        events: RefCell<Vec<ConnectionEvent>>,
        buffer_changes: RefCell<Vec<(ConnectionBufferType, u64, i64)>>,
    }

    impl ConnectionCallbacks for EventLog {
        fn on_buffer_change(&self, buffer_type: ConnectionBufferType, old_size: u64, delta: i64) {
            self.buffer_changes.borrow_mut().push((buffer_type, old_size, delta));
        }

        fn on_event(&self, event: ConnectionEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    fn start_echo_server(dispatcher: &Dispatcher) -> (Rc<EchoServer>, ListenerImpl, String) {
        let socket = TcpListenSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let server = Rc::new(EchoServer::default());
        let callbacks: Weak<dyn ListenerCallbacks> = Rc::downgrade(&server) as Weak<dyn ListenerCallbacks>;
        let listener = dispatcher.create_listener(&socket, callbacks, ConnectionConfig::default()).unwrap();
        (server, listener, socket.name())
    }

    #[test]
    fn ids_increase() {
        let dispatcher = Dispatcher::new().unwrap();
        let first = dispatcher.create_client_connection("tcp://127.0.0.1:1").unwrap();
        let second = dispatcher.create_client_connection("tcp://127.0.0.1:1").unwrap();
        assert!(second.id() > first.id());
        assert_eq!(first.remote_address(), "127.0.0.1");
        assert_eq!(first.next_protocol(), "");
    }

    #[test]
    fn echo_round_trip() {
        init_tracing();
        let dispatcher = Dispatcher::new().unwrap();
        let (server, _listener, url) = start_echo_server(&dispatcher);

        let client = dispatcher.create_client_connection(&url).unwrap();
        let events = Rc::new(EventLog::default());
        client.add_connection_callbacks(Rc::downgrade(&events) as Weak<dyn ConnectionCallbacks>);
        let collect = Rc::new(Collect { dispatcher: dispatcher.clone(), received: RefCell::new(Vec::new()), expected: 11 });
        client.add_read_filter(collect.clone());

        client.connect();
        client.write(&mut Buffer::from("hello world"));
        dispatcher.run(RunType::Block);

        assert_eq!(collect.received.borrow().as_slice(), b"hello world");
        assert_eq!(events.events.borrow().as_slice(), &[ConnectionEvent::Connected]);
        assert_eq!(server.connections.borrow().len(), 1);

        client.close(ConnectionCloseType::NoFlush);
        assert_eq!(events.events.borrow().last(), Some(&ConnectionEvent::LocalClose));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn filters_run_in_order_on_read_and_reverse_on_write() {
        let dispatcher = Dispatcher::new().unwrap();
        let (_server, _listener, url) = start_echo_server(&dispatcher);
        let log = Rc::new(RefCell::new(Vec::new()));

        let client = dispatcher.create_client_connection(&url).unwrap();
        for name in ["A", "B", "C"] {
            client.add_filter(Rc::new(Recording { name, log: Rc::clone(&log) }));
        }
        client.add_read_filter(Rc::new(Collect {
            dispatcher: dispatcher.clone(),
            received: RefCell::new(Vec::new()),
            expected: 4,
        }));

        client.connect();
        client.write(&mut Buffer::from("ping"));
        assert_eq!(*log.borrow(), vec!["write:C", "write:B", "write:A"]);

        dispatcher.run(RunType::Block);
        assert_eq!(log.borrow()[3..6], ["read:A", "read:B", "read:C"]);
    }

    #[test]
    fn drained_buffer_still_runs_later_filters() {
        struct Drain(Rc<RefCell<Vec<String>>>);

        impl ReadFilter for Drain {
            fn on_data(&self, data: &mut Buffer) -> FilterStatus {
                self.0.borrow_mut().push(format!("read:A {data}"));
                data.clear();
                FilterStatus::Continue
            }

            fn initialize_read_filter_callbacks(&self, _callbacks: Rc<dyn ReadFilterCallbacks>) {}
        }

        struct ExitOnData(Dispatcher);

        impl ReadFilter for ExitOnData {
            fn on_data(&self, _data: &mut Buffer) -> FilterStatus {
                self.0.exit();
                FilterStatus::StopIteration
            }

            fn initialize_read_filter_callbacks(&self, _callbacks: Rc<dyn ReadFilterCallbacks>) {}
        }

        let dispatcher = Dispatcher::new().unwrap();
        let (_server, _listener, url) = start_echo_server(&dispatcher);
        let log = Rc::new(RefCell::new(Vec::new()));

        let client = dispatcher.create_client_connection(&url).unwrap();
        client.add_read_filter(Rc::new(Drain(Rc::clone(&log))));
        for name in ["B", "C"] {
            client.add_read_filter(Rc::new(Recording { name, log: Rc::clone(&log) }));
        }
        client.add_read_filter(Rc::new(ExitOnData(dispatcher.clone())));

        client.connect();
        client.write(&mut Buffer::from("ping"));
        dispatcher.run(RunType::Block);

        assert_eq!(log.borrow()[..3], ["read:A ping", "read:B", "read:C"]);
        assert_eq!(client.read_buffer_len(), 0);
    }

    #[test]
    fn continue_reading_from_inside_on_data_resumes_on_a_later_turn() {
        struct Gate {
            callbacks: RefCell<Option<Rc<dyn ReadFilterCallbacks>>>,
            held: Cell<u32>,
        }

        impl ReadFilter for Gate {
            fn on_data(&self, _data: &mut Buffer) -> FilterStatus {
                self.held.set(self.held.get() + 1);
                if let Some(callbacks) = self.callbacks.borrow().as_ref() {
                    callbacks.continue_reading();
                }
                FilterStatus::StopIteration
            }

            fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>) {
                *self.callbacks.borrow_mut() = Some(callbacks);
            }
        }

        let dispatcher = Dispatcher::new().unwrap();
        let (_server, _listener, url) = start_echo_server(&dispatcher);

        let client = dispatcher.create_client_connection(&url).unwrap();
        let gate = Rc::new(Gate { callbacks: RefCell::new(None), held: Cell::new(0) });
        client.add_read_filter(gate.clone());
        let collect = Rc::new(Collect { dispatcher: dispatcher.clone(), received: RefCell::new(Vec::new()), expected: 4 });
        client.add_read_filter(collect.clone());

        client.connect();
        client.write(&mut Buffer::from("gate"));
        dispatcher.run(RunType::Block);

        assert_eq!(collect.received.borrow().as_slice(), b"gate");
        assert!(gate.held.get() >= 1);
    }

    #[test]
    fn close_is_idempotent() {
        let dispatcher = Dispatcher::new().unwrap();
        let client = dispatcher.create_client_connection("tcp://127.0.0.1:1").unwrap();

        let mut callbacks = MockConnectionCallbacks::new();
        callbacks.expect_on_event().with(eq(ConnectionEvent::LocalClose)).times(1).return_const(());
        let callbacks = Rc::new(callbacks);
        client.add_connection_callbacks(Rc::downgrade(&callbacks) as Weak<dyn ConnectionCallbacks>);

        client.close(ConnectionCloseType::NoFlush);
        client.close(ConnectionCloseType::NoFlush);
        client.close(ConnectionCloseType::FlushWrite);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn write_reports_buffer_growth_and_nothing_after_close() {
        let dispatcher = Dispatcher::new().unwrap();
        let client = dispatcher.create_client_connection("tcp://127.0.0.1:1").unwrap();

        let mut callbacks = MockConnectionCallbacks::new();
        callbacks
            .expect_on_buffer_change()
            .with(eq(ConnectionBufferType::Write), eq(0u64), eq(100i64))
            .times(1)
            .return_const(());
        callbacks
            .expect_on_buffer_change()
            .with(eq(ConnectionBufferType::Write), eq(100u64), eq(50i64))
            .times(1)
            .return_const(());
        callbacks.expect_on_event().with(eq(ConnectionEvent::LocalClose)).times(1).return_const(());
        let callbacks = Rc::new(callbacks);
        client.add_connection_callbacks(Rc::downgrade(&callbacks) as Weak<dyn ConnectionCallbacks>);

        client.write(&mut Buffer::from(vec![b'x'; 100]));
        client.write(&mut Buffer::from(vec![b'x'; 50]));
        assert_eq!(client.write_buffer_len(), 150);

        // not connected, so there is nothing to flush through
        client.close(ConnectionCloseType::FlushWrite);
        let mut late = Buffer::from("late");
        client.write(&mut late);
        assert!(late.is_empty());
        assert_eq!(client.write_buffer_len(), 0);
    }

    #[test]
    fn refused_connect_raises_remote_close() {
        let dispatcher = Dispatcher::new().unwrap();
        let url = {
            let socket = TcpListenSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let url = socket.name();
            socket.close();
            url
        };

        let client = dispatcher.create_client_connection(&url).unwrap();
        let events = Rc::new(EventLog::default());
        client.add_connection_callbacks(Rc::downgrade(&events) as Weak<dyn ConnectionCallbacks>);
        client.write(&mut Buffer::from("never sent"));
        client.connect();
        dispatcher.run(RunType::Block);

        assert_eq!(events.events.borrow().as_slice(), &[ConnectionEvent::RemoteClose]);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn flush_write_close_delivers_pending_bytes() {
        init_tracing();
        struct Counting {
            received: Rc<Cell<usize>>,
        }

        impl ReadFilter for Counting {
            fn on_data(&self, data: &mut Buffer) -> FilterStatus {
                self.received.set(self.received.get() + data.len());
                data.clear();
                FilterStatus::StopIteration
            }

            fn initialize_read_filter_callbacks(&self, _callbacks: Rc<dyn ReadFilterCallbacks>) {}
        }

        struct ExitOnClose {
            dispatcher: Dispatcher,
            events: RefCell<Vec<ConnectionEvent>>,
        }

        impl ConnectionCallbacks for ExitOnClose {
            fn on_buffer_change(&self, _buffer_type: ConnectionBufferType, _old_size: u64, _delta: i64) {}

            fn on_event(&self, event: ConnectionEvent) {
                self.events.borrow_mut().push(event);
                if event.is_close() {
                    self.dispatcher.exit();
                }
            }
        }

        struct Sink {
            received: Rc<Cell<usize>>,
            observer: Rc<ExitOnClose>,
            connections: RefCell<Vec<ConnectionPtr>>,
        }

        impl ListenerCallbacks for Sink {
            fn on_new_connection(&self, connection: ConnectionPtr) {
                connection.add_read_filter(Rc::new(Counting { received: Rc::clone(&self.received) }));
                connection.add_connection_callbacks(Rc::downgrade(&self.observer) as Weak<dyn ConnectionCallbacks>);
                self.connections.borrow_mut().push(connection);
            }
        }

        let dispatcher = Dispatcher::new().unwrap();
        let socket = TcpListenSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let sink = Rc::new(Sink {
            received: Rc::new(Cell::new(0)),
            observer: Rc::new(ExitOnClose { dispatcher: dispatcher.clone(), events: RefCell::new(Vec::new()) }),
            connections: RefCell::new(Vec::new()),
        });
        let _listener = dispatcher
            .create_listener(&socket, Rc::downgrade(&sink) as Weak<dyn ListenerCallbacks>, ConnectionConfig::default())
            .unwrap();

        let client = dispatcher.create_client_connection(&socket.name()).unwrap();
        client.connect();
        client.write(&mut Buffer::from(vec![b'z'; 256 * 1024]));
        client.close(ConnectionCloseType::FlushWrite);
        assert_eq!(client.state(), ConnectionState::Closing);

        dispatcher.run(RunType::Block);

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(sink.received.get(), 256 * 1024);
        assert_eq!(sink.observer.events.borrow().as_slice(), &[ConnectionEvent::RemoteClose]);
    }

    #[test]
    fn read_disable_holds_bytes_until_reenabled() {
        init_tracing();

        /// Leaves the first delivery buffered and pauses reads; collects everything after.
        struct Pause {
            dispatcher: Dispatcher,
            callbacks: RefCell<Option<Rc<dyn ReadFilterCallbacks>>>,
            deliveries: RefCell<Vec<usize>>,
            received: RefCell<Vec<u8>>,
        }

        impl ReadFilter for Pause {
            fn on_data(&self, data: &mut Buffer) -> FilterStatus {
                let first = self.deliveries.borrow().is_empty();
                self.deliveries.borrow_mut().push(data.len());
                if first {
                    if let Some(callbacks) = self.callbacks.borrow().as_ref() {
                        callbacks.connection().read_disable(true);
                    }
                    return FilterStatus::StopIteration;
                }
                self.received.borrow_mut().extend_from_slice(data.as_slice());
                data.clear();
                if self.received.borrow().len() >= 8 {
                    self.dispatcher.exit();
                }
                FilterStatus::StopIteration
            }

            fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>) {
                *self.callbacks.borrow_mut() = Some(callbacks);
            }
        }

        let dispatcher = Dispatcher::new().unwrap();
        let (_server, _listener, url) = start_echo_server(&dispatcher);

        let client = dispatcher.create_client_connection(&url).unwrap();
        let pause = Rc::new(Pause {
            dispatcher: dispatcher.clone(),
            callbacks: RefCell::new(None),
            deliveries: RefCell::new(Vec::new()),
            received: RefCell::new(Vec::new()),
        });
        client.add_read_filter(pause.clone());

        let observed = Rc::new(RefCell::new(Vec::new()));
        let reenable = {
            let (client, pause, observed) = (Rc::clone(&client), Rc::clone(&pause), Rc::clone(&observed));
            Rc::new(dispatcher.create_timer(move || {
                // the echo of "more" is waiting in the socket, unread
                observed.borrow_mut().push((client.read_enabled(), pause.deliveries.borrow().len()));
                client.read_disable(false);
                observed.borrow_mut().push((client.read_enabled(), pause.deliveries.borrow().len()));
            }))
        };
        let write_more = {
            let (client, pause, observed, reenable) =
                (Rc::clone(&client), Rc::clone(&pause), Rc::clone(&observed), Rc::clone(&reenable));
            dispatcher.create_timer(move || {
                observed.borrow_mut().push((client.read_enabled(), pause.deliveries.borrow().len()));
                client.write(&mut Buffer::from("more"));
                reenable.enable(Duration::from_millis(100));
            })
        };

        client.connect();
        client.write(&mut Buffer::from("ping"));
        write_more.enable(Duration::from_millis(100));
        dispatcher.run(RunType::Block);

        assert_eq!(*observed.borrow(), vec![(false, 1), (false, 1), (true, 1)]);
        assert_eq!(pause.deliveries.borrow()[0], 4);
        assert_eq!(pause.received.borrow().as_slice(), b"pingmore");
        assert!(client.read_enabled());
    }
}
