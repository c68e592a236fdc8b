//! `mockall` doubles for every capability trait in this crate.
//!
//! Each double has a `nice()` constructor that accepts any call and answers with a benign
//! value, so a test only states the calls it cares about. Expectations are matched in the
//! order they were added: to override a nice default, `checkpoint()` the mock first or
//! start from `new()`.

use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use mockall::mock;

use crate::buffer::Buffer;
use crate::event::Dispatcher;
use crate::network::{
    ClientConnection, Connection, ConnectionBufferType, ConnectionCallbacks, ConnectionCloseType, ConnectionEvent,
    ConnectionPtr, ConnectionState, DnsResolver, DrainDecision, Filter, FilterChainFactory, FilterStatus, ListenSocket,
    Listener, ListenerCallbacks, ReadFilter, ReadFilterCallbacks, ResolveCb, WriteFilter,
};
use crate::ssl::SslConnection;
use crate::upstream::HostDescription;

mock! {
    pub Connection {}

    impl Connection for Connection {
        fn add_connection_callbacks(&self, callbacks: Weak<dyn ConnectionCallbacks>);
        fn add_write_filter(&self, filter: Rc<dyn WriteFilter>);
        fn add_filter(&self, filter: Rc<dyn Filter>);
        fn add_read_filter(&self, filter: Rc<dyn ReadFilter>);
        fn close(&self, close_type: ConnectionCloseType);
        fn dispatcher(&self) -> Dispatcher;
        fn id(&self) -> u64;
        fn next_protocol(&self) -> String;
        fn no_delay(&self, enable: bool);
        fn read_disable(&self, disable: bool);
        fn read_enabled(&self) -> bool;
        fn remote_address(&self) -> String;
        fn ssl(&self) -> Option<Rc<dyn SslConnection>>;
        fn state(&self) -> ConnectionState;
        fn write(&self, data: &mut Buffer);
    }
}

mock! {
    pub ClientConnection {}

    impl Connection for ClientConnection {
        fn add_connection_callbacks(&self, callbacks: Weak<dyn ConnectionCallbacks>);
        fn add_write_filter(&self, filter: Rc<dyn WriteFilter>);
        fn add_filter(&self, filter: Rc<dyn Filter>);
        fn add_read_filter(&self, filter: Rc<dyn ReadFilter>);
        fn close(&self, close_type: ConnectionCloseType);
        fn dispatcher(&self) -> Dispatcher;
        fn id(&self) -> u64;
        fn next_protocol(&self) -> String;
        fn no_delay(&self, enable: bool);
        fn read_disable(&self, disable: bool);
        fn read_enabled(&self) -> bool;
        fn remote_address(&self) -> String;
        fn ssl(&self) -> Option<Rc<dyn SslConnection>>;
        fn state(&self) -> ConnectionState;
        fn write(&self, data: &mut Buffer);
    }

    impl ClientConnection for ClientConnection {
        fn connect(&self);
    }
}

mock! {
    pub ConnectionCallbacks {}

    impl ConnectionCallbacks for ConnectionCallbacks {
        fn on_buffer_change(&self, buffer_type: ConnectionBufferType, old_size: u64, delta: i64);
        fn on_event(&self, event: ConnectionEvent);
    }
}

mock! {
    pub DnsResolver {}

    impl DnsResolver for DnsResolver {
        fn dispatcher(&self) -> Dispatcher;
        fn resolve(&self, name: &str, callback: ResolveCb);
    }
}

mock! {
    pub ReadFilter {}

    impl ReadFilter for ReadFilter {
        fn on_data(&self, data: &mut Buffer) -> FilterStatus;
        fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>);
    }
}

mock! {
    pub WriteFilter {}

    impl WriteFilter for WriteFilter {
        fn on_write(&self, data: &mut Buffer) -> FilterStatus;
    }
}

mock! {
    pub Filter {}

    impl ReadFilter for Filter {
        fn on_data(&self, data: &mut Buffer) -> FilterStatus;
        fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>);
    }

    impl WriteFilter for Filter {
        fn on_write(&self, data: &mut Buffer) -> FilterStatus;
    }
}

mock! {
    pub ReadFilterCallbacks {}

    impl ReadFilterCallbacks for ReadFilterCallbacks {
        fn connection(&self) -> Rc<dyn Connection>;
        fn continue_reading(&self);
        fn upstream_host(&self) -> Option<Rc<dyn HostDescription>>;
        fn set_upstream_host(&self, host: Rc<dyn HostDescription>);
    }
}

mock! {
    pub ListenerCallbacks {}

    impl ListenerCallbacks for ListenerCallbacks {
        fn on_new_connection(&self, connection: ConnectionPtr);
    }
}

mock! {
    pub Listener {}

    impl Listener for Listener {
        fn enable(&self);
        fn disable(&self);
        fn local_address(&self) -> SocketAddr;
    }
}

mock! {
    pub ListenSocket {}

    impl ListenSocket for ListenSocket {
        fn name(&self) -> String;
        fn fd(&self) -> RawFd;
        fn close(&self);
    }
}

mock! {
    pub DrainDecision {}

    impl DrainDecision for DrainDecision {
        fn drain_close(&self) -> bool;
    }
}

mock! {
    pub FilterChainFactory {}

    impl FilterChainFactory for FilterChainFactory {
        fn create_filter_chain(&self, connection: &ConnectionPtr) -> bool;
    }
}

mock! {
    pub SslConnection {}

    impl SslConnection for SslConnection {
        fn next_protocol(&self) -> String;
        fn sha256_peer_certificate_digest(&self) -> String;
    }
}

mock! {
    pub HostDescription {}

    impl HostDescription for HostDescription {
        fn url(&self) -> String;
        fn canary(&self) -> bool;
        fn zone(&self) -> String;
    }
}

macro_rules! nice_connection {
    ($mock:ident, $dispatcher:ident) => {{
        let mut mock = $mock::new();
        mock.expect_add_connection_callbacks().returning(|_| ());
        mock.expect_add_write_filter().returning_st(|_| ());
        mock.expect_add_filter().returning_st(|_| ());
        mock.expect_add_read_filter().returning_st(|_| ());
        mock.expect_close().returning(|_| ());
        mock.expect_dispatcher().returning_st(move || $dispatcher.clone());
        mock.expect_id().return_const(0u64);
        mock.expect_next_protocol().returning(String::new);
        mock.expect_no_delay().returning(|_| ());
        mock.expect_read_disable().returning(|_| ());
        mock.expect_read_enabled().return_const(true);
        mock.expect_remote_address().returning(|| "127.0.0.1".to_owned());
        mock.expect_ssl().returning_st(|| None);
        mock.expect_state().return_const(ConnectionState::Open);
        mock.expect_write().returning(|_| ());
        mock
    }};
}

impl MockConnection {
    /// An open connection bound to `dispatcher` that accepts everything.
    pub fn nice(dispatcher: Dispatcher) -> Self {
        nice_connection!(MockConnection, dispatcher)
    }
}

impl MockClientConnection {
    pub fn nice(dispatcher: Dispatcher) -> Self {
        let mut mock = nice_connection!(MockClientConnection, dispatcher);
        mock.expect_connect().returning(|| ());
        mock
    }
}

impl MockConnectionCallbacks {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_on_buffer_change().returning(|_, _, _| ());
        mock.expect_on_event().returning(|_| ());
        mock
    }
}

impl MockDnsResolver {
    /// Resolves every name to nothing, asynchronously, like a failed lookup.
    pub fn nice(dispatcher: Dispatcher) -> Self {
        let mut mock = Self::new();
        let resolve_dispatcher = dispatcher.clone();
        mock.expect_dispatcher().returning_st(move || dispatcher.clone());
        mock.expect_resolve().returning_st(move |_, callback| {
            resolve_dispatcher.post(move || callback(Vec::<IpAddr>::new()));
        });
        mock
    }
}

impl MockReadFilter {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_on_data().return_const(FilterStatus::Continue);
        mock.expect_initialize_read_filter_callbacks().returning_st(|_| ());
        mock
    }
}

impl MockWriteFilter {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_on_write().return_const(FilterStatus::Continue);
        mock
    }
}

impl MockFilter {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_on_data().return_const(FilterStatus::Continue);
        mock.expect_initialize_read_filter_callbacks().returning_st(|_| ());
        mock.expect_on_write().return_const(FilterStatus::Continue);
        mock
    }
}

impl MockReadFilterCallbacks {
    pub fn nice(connection: Rc<dyn Connection>) -> Self {
        let mut mock = Self::new();
        mock.expect_connection().returning_st(move || Rc::clone(&connection));
        mock.expect_continue_reading().returning(|| ());
        mock.expect_upstream_host().returning_st(|| None);
        mock.expect_set_upstream_host().returning_st(|_| ());
        mock
    }
}

impl MockListenerCallbacks {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_on_new_connection().returning_st(|_| ());
        mock
    }
}

impl MockListener {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_enable().returning(|| ());
        mock.expect_disable().returning(|| ());
        mock.expect_local_address().returning(|| SocketAddr::from(([127, 0, 0, 1], 0)));
        mock
    }
}

impl MockListenSocket {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_name().returning(|| "tcp://127.0.0.1:0".to_owned());
        mock.expect_fd().return_const(-1);
        mock.expect_close().returning(|| ());
        mock
    }
}

impl MockDrainDecision {
    /// Never drains.
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_drain_close().return_const(false);
        mock
    }
}

impl MockFilterChainFactory {
    /// Accepts every connection without installing filters.
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_create_filter_chain().returning_st(|_| true);
        mock
    }
}

impl MockSslConnection {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_next_protocol().returning(String::new);
        mock.expect_sha256_peer_certificate_digest().returning(String::new);
        mock
    }
}

impl MockHostDescription {
    pub fn nice() -> Self {
        let mut mock = Self::new();
        mock.expect_url().returning(|| "tcp://127.0.0.1:80".to_owned());
        mock.expect_canary().return_const(false);
        mock.expect_zone().returning(String::new);
        mock
    }
}
