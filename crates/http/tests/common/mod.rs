#![allow(dead_code, reason = "each test binary uses a different part of the harness")]

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use micro_proxy_http::codec::{CodecSettings, CodecType, ServerConnectionCallbacks};
use micro_proxy_http::codec_client::CodecClient;
use micro_proxy_http::protocol::{Headers, StreamCallbacks, StreamDecoder, StreamEncoder, StreamFault, StreamResetReason};
use micro_proxy_http::server::ServerCodecFilter;
use micro_proxy_net::ConnectionConfig;
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::event::{Dispatcher, Poster, RunType};
use micro_proxy_net::network::{
    ClientConnection, Connection, ConnectionBufferType, ConnectionCallbacks, ConnectionCloseType, ConnectionEvent,
    ConnectionImpl, ConnectionPtr, DrainDecision, FilterChainFactory, FilterStatus, ReadFilter, ReadFilterCallbacks,
    TcpListenSocket,
};
use micro_proxy_net::server::ConnectionHandler;
use micro_proxy_net::stats::NullStatsSink;
use tracing::warn;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Buffers one response. The on-complete callback runs exactly when `end_stream` is seen.
pub struct BufferingStreamDecoder {
    headers: RefCell<Option<Headers>>,
    body: RefCell<Vec<u8>>,
    complete: Cell<bool>,
    on_complete: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl BufferingStreamDecoder {
    pub fn new(on_complete: impl FnOnce() + 'static) -> Rc<Self> {
        Rc::new(Self {
            headers: RefCell::new(None),
            body: RefCell::new(Vec::new()),
            complete: Cell::new(false),
            on_complete: RefCell::new(Some(Box::new(on_complete))),
        })
    }

    pub fn headers(&self) -> Option<Headers> {
        self.headers.borrow().clone()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.headers.borrow().as_ref().and_then(Headers::status)
    }

    pub fn body(&self) -> String {
        String::from_utf8_lossy(&self.body.borrow()).into_owned()
    }

    pub fn complete(&self) -> bool {
        self.complete.get()
    }

    fn on_decode(&self, end_stream: bool) {
        if !end_stream {
            return;
        }
        self.complete.set(true);
        let on_complete = self.on_complete.borrow_mut().take();
        if let Some(on_complete) = on_complete {
            on_complete();
        }
    }
}

impl StreamDecoder for BufferingStreamDecoder {
    fn decode_headers(&self, headers: Headers, end_stream: bool) -> Result<(), StreamFault> {
        if self.complete.get() {
            return Err(StreamFault::DecodeAfterComplete);
        }
        *self.headers.borrow_mut() = Some(headers);
        self.on_decode(end_stream);
        Ok(())
    }

    fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), StreamFault> {
        if self.complete.get() {
            return Err(StreamFault::DecodeAfterComplete);
        }
        self.body.borrow_mut().extend_from_slice(data.as_slice());
        data.clear();
        self.on_decode(end_stream);
        Ok(())
    }

    fn decode_trailers(&self, _trailers: HeaderMap) -> Result<(), StreamFault> {
        Err(StreamFault::Unsupported { feature: "trailers" })
    }
}

impl StreamCallbacks for BufferingStreamDecoder {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        panic!("unexpected stream reset: {reason}");
    }
}

/// Stops a `Block` run once the observed connection closes.
struct ExitOnClose(Dispatcher);

impl ConnectionCallbacks for ExitOnClose {
    fn on_buffer_change(&self, _buffer_type: ConnectionBufferType, _old_size: u64, _delta: i64) {}

    fn on_event(&self, event: ConnectionEvent) {
        if event.is_close() {
            self.0.exit();
        }
    }
}

/// Sends one request on a fresh connection and runs until the response completes.
pub fn make_single_request(
    port: u16,
    method: Method,
    path: &str,
    body: &str,
    codec_type: CodecType,
) -> Rc<BufferingStreamDecoder> {
    let dispatcher = Dispatcher::new().unwrap();
    let connection = dispatcher.create_client_connection(&format!("tcp://127.0.0.1:{port}")).unwrap();
    let client = CodecClient::new(codec_type, connection, Rc::new(NullStatsSink), CodecSettings::default());
    let exit = Rc::new(ExitOnClose(dispatcher.clone()));
    client.add_connection_callbacks(Rc::downgrade(&exit) as Weak<dyn ConnectionCallbacks>);

    let weak_client = Rc::downgrade(&client);
    let response = BufferingStreamDecoder::new(move || {
        if let Some(client) = weak_client.upgrade() {
            client.close();
        }
    });
    let encoder = client.new_stream(Rc::clone(&response) as Rc<dyn StreamDecoder>);
    encoder.stream().add_callbacks(Rc::downgrade(&response) as Weak<dyn StreamCallbacks>);

    let mut headers = Headers::new();
    headers.set_method(method);
    headers.set_path(path);
    headers.set_scheme("http");
    headers.insert(header::HOST, HeaderValue::from_str(&format!("127.0.0.1:{port}")).unwrap());
    encoder.encode_headers(&headers, body.is_empty()).unwrap();
    if !body.is_empty() {
        encoder.encode_data(&mut Buffer::from(body), true).unwrap();
    }

    dispatcher.run(RunType::Block);
    response
}

type DataCallback = Box<dyn FnMut(&dyn Connection, &mut Buffer)>;

struct ForwardingFilter {
    on_data: RefCell<DataCallback>,
    read_callbacks: RefCell<Option<Rc<dyn ReadFilterCallbacks>>>,
}

impl ReadFilter for ForwardingFilter {
    fn on_data(&self, data: &mut Buffer) -> FilterStatus {
        let read_callbacks = self.read_callbacks.borrow().as_ref().map(Rc::clone);
        if let Some(read_callbacks) = read_callbacks {
            let connection = read_callbacks.connection();
            (self.on_data.borrow_mut())(&*connection, data);
        }
        FilterStatus::StopIteration
    }

    fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>) {
        *self.read_callbacks.borrow_mut() = Some(callbacks);
    }
}

/// Writes raw bytes to a server and hands everything it answers to a callback.
pub struct RawConnectionDriver {
    dispatcher: Dispatcher,
    connection: Rc<ConnectionImpl>,
    _exit: Rc<ExitOnClose>,
}

impl RawConnectionDriver {
    pub fn new<F>(port: u16, initial: &mut Buffer, on_data: F) -> Self
    where
        F: FnMut(&dyn Connection, &mut Buffer) + 'static,
    {
        let dispatcher = Dispatcher::new().unwrap();
        let connection = dispatcher.create_client_connection(&format!("tcp://127.0.0.1:{port}")).unwrap();
        connection.add_read_filter(Rc::new(ForwardingFilter {
            on_data: RefCell::new(Box::new(on_data)),
            read_callbacks: RefCell::new(None),
        }));
        let exit = Rc::new(ExitOnClose(dispatcher.clone()));
        connection.add_connection_callbacks(Rc::downgrade(&exit) as Weak<dyn ConnectionCallbacks>);
        connection.connect();
        connection.write(initial);
        Self { dispatcher, connection, _exit: exit }
    }

    /// Runs until the connection closes.
    pub fn run(&self) {
        self.dispatcher.run(RunType::Block);
    }

    pub fn close(&self) {
        self.connection.close(ConnectionCloseType::FlushWrite);
    }
}

/// Answers `GET /status` with an empty 200 and echoes the body of `POST /echo`.
/// Everything else is a 404.
struct Routes {
    log: Arc<Mutex<Vec<String>>>,
}

impl ServerConnectionCallbacks for Routes {
    fn new_stream(&self, response_encoder: Rc<dyn StreamEncoder>) -> Rc<dyn StreamDecoder> {
        Rc::new(RouteStream {
            log: Arc::clone(&self.log),
            encoder: response_encoder,
            request: RefCell::new(None),
            body: RefCell::new(Vec::new()),
        })
    }
}

struct RouteStream {
    log: Arc<Mutex<Vec<String>>>,
    encoder: Rc<dyn StreamEncoder>,
    request: RefCell<Option<(Method, String)>>,
    body: RefCell<Vec<u8>>,
}

impl RouteStream {
    fn record(&self, line: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(line);
        }
    }

    fn respond(&self) {
        let request = self.request.borrow_mut().take();
        let body = std::mem::take(&mut *self.body.borrow_mut());
        let result = match request {
            Some((Method::GET, path)) if path == "/status" => {
                self.encoder.encode_headers(&Headers::response(StatusCode::OK), true)
            }
            Some((Method::POST, path)) if path == "/echo" && !body.is_empty() => {
                let headers = Headers::response(StatusCode::OK)
                    .with_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                self.encoder
                    .encode_headers(&headers, false)
                    .and_then(|()| self.encoder.encode_data(&mut Buffer::from(body), true))
            }
            _ => self.encoder.encode_headers(&Headers::response(StatusCode::NOT_FOUND), true),
        };
        if let Err(e) = result {
            warn!(cause = %e, "test server failed to respond");
        }
    }
}

impl StreamDecoder for RouteStream {
    fn decode_headers(&self, headers: Headers, end_stream: bool) -> Result<(), StreamFault> {
        let method = headers.method().cloned().unwrap_or_default();
        let path = headers.path().unwrap_or_default().to_owned();
        self.record(format!("headers {method} {path} {end_stream}"));
        *self.request.borrow_mut() = Some((method, path));
        if end_stream {
            self.respond();
        }
        Ok(())
    }

    fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), StreamFault> {
        self.record(format!("data {data} {end_stream}"));
        self.body.borrow_mut().extend_from_slice(data.as_slice());
        data.clear();
        if end_stream {
            self.respond();
        }
        Ok(())
    }

    fn decode_trailers(&self, _trailers: HeaderMap) -> Result<(), StreamFault> {
        Err(StreamFault::Unsupported { feature: "trailers" })
    }
}

struct HttpFilterChain {
    codec_type: CodecType,
    log: Arc<Mutex<Vec<String>>>,
}

impl FilterChainFactory for HttpFilterChain {
    fn create_filter_chain(&self, connection: &ConnectionPtr) -> bool {
        let routes = Rc::new(Routes { log: Arc::clone(&self.log) });
        connection.add_read_filter(ServerCodecFilter::new(self.codec_type, routes, CodecSettings::default()));
        true
    }
}

struct NeverDrain;

impl DrainDecision for NeverDrain {
    fn drain_close(&self) -> bool {
        false
    }
}

/// An HTTP server on its own dispatcher thread, stopped on drop.
pub struct TestServer {
    poster: Poster,
    address: SocketAddr,
    log: Arc<Mutex<Vec<String>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(codec_type: CodecType) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server_log = Arc::clone(&log);
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let dispatcher = Dispatcher::new().unwrap();
            let handler = ConnectionHandler::new(&dispatcher, Rc::new(NullStatsSink));
            let socket = TcpListenSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let factory = Rc::new(HttpFilterChain { codec_type, log: server_log });
            handler.add_listener(factory, &socket, ConnectionConfig::default(), Rc::new(NeverDrain)).unwrap();
            tx.send((dispatcher.poster(), socket.local_address())).unwrap();

            dispatcher.run(RunType::Block);
            handler.close_connections();
        });
        let (poster, address) = rx.recv().unwrap();
        Self { poster, address, log, thread: Some(thread) }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// What the server's stream decoders saw, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.poster.post(|dispatcher| dispatcher.exit());
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}
