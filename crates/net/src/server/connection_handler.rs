use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{debug, info};

use crate::event::Dispatcher;
use crate::network::{
    ConnectionBufferType, ConnectionCallbacks, ConnectionCloseType, ConnectionEvent, ConnectionPtr, ConnectionState,
    DrainDecision, FilterChainFactory, ListenSocket, Listener, ListenerCallbacks, ListenerImpl, TcpListenSocket,
};
use crate::stats::StatsSink;
use crate::{ConnectionConfig, NetworkError};

/// Runs listeners and keeps every accepted connection alive until it closes.
///
/// Each new connection is first checked against the listener's [`DrainDecision`], then
/// handed to its [`FilterChainFactory`]. A connection that is drained or gets no chain is
/// closed on the spot.
pub struct ConnectionHandler {
    dispatcher: Dispatcher,
    stats: Rc<dyn StatsSink>,
    listeners: RefCell<Vec<Rc<ActiveListener>>>,
}

impl ConnectionHandler {
    pub fn new(dispatcher: &Dispatcher, stats: Rc<dyn StatsSink>) -> Self {
        Self { dispatcher: dispatcher.clone(), stats, listeners: RefCell::new(Vec::new()) }
    }

    /// Starts accepting on `socket`.
    pub fn add_listener(
        &self,
        factory: Rc<dyn FilterChainFactory>,
        socket: &TcpListenSocket,
        config: ConnectionConfig,
        drain_decision: Rc<dyn DrainDecision>,
    ) -> Result<(), NetworkError> {
        let active = Rc::new_cyclic(|self_ref| ActiveListener {
            self_ref: self_ref.clone(),
            dispatcher: self.dispatcher.clone(),
            stats: Rc::clone(&self.stats),
            factory,
            drain_decision,
            listener: RefCell::new(None),
            connections: RefCell::new(HashMap::new()),
        });

        let callbacks: Weak<dyn ListenerCallbacks> = Rc::downgrade(&active) as Weak<dyn ListenerCallbacks>;
        let listener = self.dispatcher.create_listener(socket, callbacks, config)?;
        *active.listener.borrow_mut() = Some(listener);

        info!(name = %socket.name(), "listener added");
        self.listeners.borrow_mut().push(active);
        Ok(())
    }

    pub fn num_connections(&self) -> usize {
        self.listeners.borrow().iter().map(|listener| listener.connections.borrow().len()).sum()
    }

    /// Stops accepting on every listener. Open connections are left alone.
    pub fn close_listeners(&self) {
        for listener in self.listeners.borrow().iter() {
            if let Some(listener) = listener.listener.borrow_mut().take() {
                listener.disable();
            }
        }
    }

    /// Closes every open connection without flushing.
    pub fn close_connections(&self) {
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            let connections: Vec<_> = listener.connections.borrow().values().cloned().collect();
            for active in connections {
                active.connection.close(ConnectionCloseType::NoFlush);
            }
        }
    }
}

struct ActiveListener {
    self_ref: Weak<ActiveListener>,
    dispatcher: Dispatcher,
    stats: Rc<dyn StatsSink>,
    factory: Rc<dyn FilterChainFactory>,
    drain_decision: Rc<dyn DrainDecision>,
    listener: RefCell<Option<ListenerImpl>>,
    connections: RefCell<HashMap<u64, Rc<ActiveConnection>>>,
}

impl ActiveListener {
    fn remove_connection(&self, id: u64) {
        let Some(active) = self.connections.borrow_mut().remove(&id) else {
            return;
        };
        debug!(connection_id = id, "releasing closed connection");
        self.stats.gauge_add("downstream_cx_active", -1);
        // the connection is still raising its close event
        self.dispatcher.deferred_delete(Box::new(active));
    }
}

impl ListenerCallbacks for ActiveListener {
    fn on_new_connection(&self, connection: ConnectionPtr) {
        self.stats.counter_inc("downstream_cx_total");

        if self.drain_decision.drain_close() {
            debug!(connection_id = connection.id(), "draining, closing new connection");
            self.stats.counter_inc("downstream_cx_drain_close");
            connection.close(ConnectionCloseType::NoFlush);
            return;
        }

        if !self.factory.create_filter_chain(&connection) {
            debug!(connection_id = connection.id(), "no filter chain, closing new connection");
            self.stats.counter_inc("downstream_cx_no_filter_chain");
            connection.close(ConnectionCloseType::NoFlush);
            return;
        }

        if connection.state() == ConnectionState::Closed {
            return;
        }

        let id = connection.id();
        let active = Rc::new(ActiveConnection { listener: self.self_ref.clone(), connection });
        let callbacks: Weak<dyn ConnectionCallbacks> = Rc::downgrade(&active) as Weak<dyn ConnectionCallbacks>;
        active.connection.add_connection_callbacks(callbacks);

        self.connections.borrow_mut().insert(id, active);
        self.stats.gauge_add("downstream_cx_active", 1);
    }
}

struct ActiveConnection {
    listener: Weak<ActiveListener>,
    connection: ConnectionPtr,
}

impl ConnectionCallbacks for ActiveConnection {
    fn on_buffer_change(&self, _buffer_type: ConnectionBufferType, _old_size: u64, _delta: i64) {}

    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close()
            && let Some(listener) = self.listener.upgrade()
        {
            listener.remove_connection(self.connection.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::buffer::Buffer;
    use crate::event::RunType;
    use crate::mocks::{MockDrainDecision, MockFilterChainFactory};
    use crate::network::{ClientConnection, Connection};
    use crate::stats::IsolatedStatsStore;

    struct ExitOnClose {
        dispatcher: Dispatcher,
        closed_by: Cell<Option<ConnectionEvent>>,
    }

    impl ConnectionCallbacks for ExitOnClose {
        fn on_buffer_change(&self, _buffer_type: ConnectionBufferType, _old_size: u64, _delta: i64) {}

        fn on_event(&self, event: ConnectionEvent) {
            if event.is_close() {
                self.closed_by.set(Some(event));
                self.dispatcher.exit();
            }
        }
    }

    fn connect_client(dispatcher: &Dispatcher, socket: &TcpListenSocket) -> (Rc<dyn ClientConnection>, Rc<ExitOnClose>) {
        let client = dispatcher.create_client_connection(&socket.name()).unwrap();
        let observer = Rc::new(ExitOnClose { dispatcher: dispatcher.clone(), closed_by: Cell::new(None) });
        client.add_connection_callbacks(Rc::downgrade(&observer) as Weak<dyn ConnectionCallbacks>);
        client.connect();
        client.write(&mut Buffer::from("hello"));
        (client, observer)
    }

    fn listen() -> TcpListenSocket {
        TcpListenSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn declined_filter_chain_closes_connection() {
        let dispatcher = Dispatcher::new().unwrap();
        let stats = Rc::new(IsolatedStatsStore::new());
        let handler = ConnectionHandler::new(&dispatcher, stats.clone());
        let socket = listen();

        let mut factory = MockFilterChainFactory::new();
        factory.expect_create_filter_chain().times(1).returning(|_| false);
        handler
            .add_listener(Rc::new(factory), &socket, ConnectionConfig::default(), Rc::new(MockDrainDecision::nice()))
            .unwrap();

        let (_client, observer) = connect_client(&dispatcher, &socket);
        dispatcher.run(RunType::Block);

        assert_eq!(observer.closed_by.get(), Some(ConnectionEvent::RemoteClose));
        assert_eq!(handler.num_connections(), 0);
        assert_eq!(stats.counter("downstream_cx_total"), 1);
        assert_eq!(stats.counter("downstream_cx_no_filter_chain"), 1);
    }

    #[test]
    fn draining_listener_closes_before_filter_chain() {
        let dispatcher = Dispatcher::new().unwrap();
        let stats = Rc::new(IsolatedStatsStore::new());
        let handler = ConnectionHandler::new(&dispatcher, stats.clone());
        let socket = listen();

        let mut factory = MockFilterChainFactory::new();
        factory.expect_create_filter_chain().never();
        let mut drain = MockDrainDecision::new();
        drain.expect_drain_close().times(1).return_const(true);
        handler.add_listener(Rc::new(factory), &socket, ConnectionConfig::default(), Rc::new(drain)).unwrap();

        let (_client, observer) = connect_client(&dispatcher, &socket);
        dispatcher.run(RunType::Block);

        assert_eq!(observer.closed_by.get(), Some(ConnectionEvent::RemoteClose));
        assert_eq!(stats.counter("downstream_cx_drain_close"), 1);
    }

    #[test]
    fn accepted_connection_tracked_until_closed() {
        let dispatcher = Dispatcher::new().unwrap();
        let stats = Rc::new(IsolatedStatsStore::new());
        let handler = ConnectionHandler::new(&dispatcher, stats.clone());
        let socket = listen();

        let accepted = Rc::new(Cell::new(0));
        let mut factory = MockFilterChainFactory::new();
        {
            let accepted = Rc::clone(&accepted);
            let dispatcher = dispatcher.clone();
            factory.expect_create_filter_chain().returning_st(move |_| {
                accepted.set(accepted.get() + 1);
                dispatcher.exit();
                true
            });
        }
        handler
            .add_listener(Rc::new(factory), &socket, ConnectionConfig::default(), Rc::new(MockDrainDecision::nice()))
            .unwrap();

        let (_client, observer) = connect_client(&dispatcher, &socket);
        dispatcher.run(RunType::Block);
        assert_eq!(accepted.get(), 1);
        assert_eq!(handler.num_connections(), 1);
        assert_eq!(stats.gauge("downstream_cx_active"), 1);

        handler.close_listeners();
        handler.close_connections();
        dispatcher.run(RunType::Block);

        assert_eq!(observer.closed_by.get(), Some(ConnectionEvent::RemoteClose));
        assert_eq!(handler.num_connections(), 0);
        assert_eq!(stats.gauge("downstream_cx_active"), 0);
    }
}
