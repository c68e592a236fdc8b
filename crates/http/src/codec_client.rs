//! An upstream HTTP connection that callers open request streams on
//!
//! A [`CodecClient`] owns one client connection and the codec framing streams onto it.
//! It sits in the connection's read filter chain, feeds every read into the codec and
//! keeps the set of requests still waiting for their response.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use http::HeaderMap;
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::{
    ClientConnection, Connection, ConnectionBufferType, ConnectionCallbacks, ConnectionCloseType, ConnectionEvent,
    FilterStatus, ReadFilter, ReadFilterCallbacks,
};
use micro_proxy_net::stats::StatsSink;
use tracing::{debug, error, trace};

use crate::codec::http1::Http1ClientCodec;
use crate::codec::http2::Http2ClientCodec;
use crate::codec::{ClientCodec, CodecSettings, CodecType};
use crate::ensure;
use crate::protocol::{
    Headers, Protocol, Stream, StreamCallbacks, StreamDecoder, StreamEncoder, StreamFault, StreamResetReason,
};

pub const UPSTREAM_CX_PROTOCOL_ERROR: &str = "upstream_cx_protocol_error";
pub const UPSTREAM_RQ_TOTAL: &str = "upstream_rq_total";
pub const UPSTREAM_RQ_RESET: &str = "upstream_rq_reset";

pub struct CodecClient {
    codec_type: CodecType,
    connection: Rc<dyn ClientConnection>,
    codec: Rc<dyn ClientCodec>,
    stats: Rc<dyn StatsSink>,
    self_ref: Weak<Self>,
    active_requests: RefCell<Vec<Rc<ActiveRequest>>>,
    connected: Cell<bool>,
}

/// Wraps the caller's decoder so the client sees the response end before the caller.
struct ActiveRequest {
    client: Weak<CodecClient>,
    response_decoder: Rc<dyn StreamDecoder>,
    stream: RefCell<Option<Rc<dyn Stream>>>,
    complete: Cell<bool>,
}

/// The read filter feeding a [`CodecClient`].
struct CodecReadFilter {
    client: Weak<CodecClient>,
}

impl CodecClient {
    /// Builds the codec for `codec_type` and starts connecting.
    pub fn new(
        codec_type: CodecType,
        connection: Rc<dyn ClientConnection>,
        stats: Rc<dyn StatsSink>,
        settings: CodecSettings,
    ) -> Rc<Self> {
        Self::with_codec(codec_type, connection, stats, |connection| match codec_type {
            CodecType::Http1 => Http1ClientCodec::new(connection, settings.http1()) as Rc<dyn ClientCodec>,
            CodecType::Http2 => Http2ClientCodec::new(connection, settings.http2()) as Rc<dyn ClientCodec>,
        })
    }

    /// Like [`CodecClient::new`] with a codec built by `codec_factory`.
    pub fn with_codec<F>(
        codec_type: CodecType,
        connection: Rc<dyn ClientConnection>,
        stats: Rc<dyn StatsSink>,
        codec_factory: F,
    ) -> Rc<Self>
    where
        F: FnOnce(Weak<dyn Connection>) -> Rc<dyn ClientCodec>,
    {
        let transport: Rc<dyn Connection> = Rc::clone(&connection) as Rc<dyn Connection>;
        let codec = codec_factory(Rc::downgrade(&transport));

        let client = Rc::new_cyclic(|self_ref| Self {
            codec_type,
            connection,
            codec,
            stats,
            self_ref: self_ref.clone(),
            active_requests: RefCell::new(Vec::new()),
            connected: Cell::new(false),
        });

        client.connection.add_read_filter(Rc::new(CodecReadFilter { client: Rc::downgrade(&client) }));
        client.connection.add_connection_callbacks(Rc::downgrade(&client) as Weak<dyn ConnectionCallbacks>);
        debug!(connection_id = client.id(), codec = ?codec_type, "codec client connecting");
        client.connection.connect();
        client
    }

    /// Opens a request stream whose response goes to `response_decoder`.
    pub fn new_stream(&self, response_decoder: Rc<dyn StreamDecoder>) -> Rc<dyn StreamEncoder> {
        let request = Rc::new(ActiveRequest {
            client: self.self_ref.clone(),
            response_decoder,
            stream: RefCell::new(None),
            complete: Cell::new(false),
        });
        let encoder = self.codec.new_stream(Rc::clone(&request) as Rc<dyn StreamDecoder>);
        let stream = encoder.stream();
        stream.add_callbacks(Rc::downgrade(&request) as Weak<dyn StreamCallbacks>);
        *request.stream.borrow_mut() = Some(stream);

        self.active_requests.borrow_mut().push(request);
        self.stats.counter_inc(UPSTREAM_RQ_TOTAL);
        trace!(connection_id = self.id(), active = self.num_active_requests(), "new request stream");
        encoder
    }

    pub fn close(&self) {
        self.connection.close(ConnectionCloseType::NoFlush);
    }

    /// Tells the peer no more streams are coming. A no-op on HTTP/1.1.
    pub fn go_away(&self) {
        self.codec.go_away();
    }

    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    pub fn num_active_requests(&self) -> usize {
        self.active_requests.borrow().len()
    }

    pub fn codec_type(&self) -> CodecType {
        self.codec_type
    }

    pub fn protocol(&self) -> Protocol {
        self.codec.protocol()
    }

    pub fn remote_address(&self) -> String {
        self.connection.remote_address()
    }

    pub fn add_connection_callbacks(&self, callbacks: Weak<dyn ConnectionCallbacks>) {
        self.connection.add_connection_callbacks(callbacks);
    }

    /// Whether the transport reported `Connected`.
    pub fn connected(&self) -> bool {
        self.connected.get()
    }

    fn remove_request(&self, request: &ActiveRequest) {
        self.active_requests.borrow_mut().retain(|active| !std::ptr::eq(Rc::as_ptr(active), request));
    }

    fn on_data(&self, data: &mut Buffer) {
        if let Err(e) = self.codec.dispatch(data) {
            error!(connection_id = self.id(), cause = %e, "protocol error on upstream connection");
            self.stats.counter_inc(UPSTREAM_CX_PROTOCOL_ERROR);
            self.close();
        }
    }

    fn on_close(&self, event: ConnectionEvent) {
        debug!(
            connection_id = self.id(),
            event = ?event,
            active = self.num_active_requests(),
            "upstream connection closed"
        );
        if !self.connected.get() {
            let pending: Vec<_> = self.active_requests.borrow().clone();
            for request in pending {
                if let Some(stream) = request.stream() {
                    stream.reset_stream(StreamResetReason::ConnectionFailure);
                }
            }
        }
        self.codec.on_transport_close();
    }
}

impl ConnectionCallbacks for CodecClient {
    fn on_buffer_change(&self, _buffer_type: ConnectionBufferType, _old_size: u64, _delta: i64) {}

    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                trace!(connection_id = self.id(), "upstream connected");
                self.connected.set(true);
            }
            event if event.is_close() => self.on_close(event),
            _ => {}
        }
    }
}

impl fmt::Debug for CodecClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecClient")
            .field("codec_type", &self.codec_type)
            .field("active_requests", &self.active_requests.borrow().len())
            .field("connected", &self.connected.get())
            .finish_non_exhaustive()
    }
}

impl ActiveRequest {
    fn stream(&self) -> Option<Rc<dyn Stream>> {
        self.stream.borrow().clone()
    }

    /// Marks the response complete and retires the request; fails if it already was.
    fn complete(&self, end_stream: bool) -> Result<(), StreamFault> {
        ensure!(!self.complete.get(), StreamFault::DecodeAfterComplete);
        if end_stream {
            self.complete.set(true);
            if let Some(client) = self.client.upgrade() {
                client.remove_request(self);
            }
        }
        Ok(())
    }
}

impl StreamDecoder for ActiveRequest {
    fn decode_headers(&self, headers: Headers, end_stream: bool) -> Result<(), StreamFault> {
        self.complete(end_stream)?;
        self.response_decoder.decode_headers(headers, end_stream)
    }

    fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), StreamFault> {
        self.complete(end_stream)?;
        self.response_decoder.decode_data(data, end_stream)
    }

    fn decode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamFault> {
        self.complete(true)?;
        self.response_decoder.decode_trailers(trailers)
    }
}

impl StreamCallbacks for ActiveRequest {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        debug!(connection_id = client.id(), reason = %reason, "request stream reset");
        client.stats.counter_inc(UPSTREAM_RQ_RESET);
        client.remove_request(self);
    }
}

impl ReadFilter for CodecReadFilter {
    fn on_data(&self, data: &mut Buffer) -> FilterStatus {
        if let Some(client) = self.client.upgrade() {
            client.on_data(data);
        }
        FilterStatus::StopIteration
    }

    fn initialize_read_filter_callbacks(&self, _callbacks: Rc<dyn ReadFilterCallbacks>) {}
}
