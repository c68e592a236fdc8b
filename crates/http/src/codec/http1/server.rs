use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use http::{HeaderMap, Method};
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::{Connection, ConnectionCloseType, ConnectionState};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use super::header::RequestHeaderDecoder;
use super::message_decoder::MessageDecoder;
use super::stream::{Http1Stream, MessageEncoder};
use crate::codec::{CodecConnection, Http1Settings, ServerCodec, ServerConnectionCallbacks, write_to};
use crate::protocol::{
    CodecError, Headers, Message, PayloadItem, Protocol, Stream, StreamDecoder, StreamEncoder, StreamResetReason,
};

/// The server side of HTTP/1.1.
///
/// Requests are served one at a time. Bytes of a pipelined request that arrive while the
/// previous response is still open stay in the connection buffer, and reading pauses
/// until that response completes.
pub struct Http1ServerCodec {
    connection: Weak<dyn Connection>,
    self_ref: Weak<Self>,
    callbacks: Rc<dyn ServerConnectionCallbacks>,
    decoder: RefCell<MessageDecoder<RequestHeaderDecoder>>,
    active: RefCell<Option<Rc<ServerStream>>>,
    read_paused: Cell<bool>,
}

struct ServerStream {
    codec: Weak<Http1ServerCodec>,
    connection: Weak<dyn Connection>,
    stream: Rc<Http1Stream>,
    encoder: MessageEncoder,
    request_decoder: RefCell<Option<Rc<dyn StreamDecoder>>>,
    head_request: bool,
    request_complete: Cell<bool>,
    close_after_response: Cell<bool>,
}

impl ServerStream {
    fn is_finished(&self) -> bool {
        self.request_complete.get() && self.encoder.is_complete()
    }

    fn request_decoder(&self) -> Option<Rc<dyn StreamDecoder>> {
        self.request_decoder.borrow().clone()
    }

    fn after_encode(&self) {
        if self.encoder.is_complete()
            && let Some(codec) = self.codec.upgrade()
        {
            codec.on_stream_progress();
        }
    }
}

impl Http1ServerCodec {
    pub fn new(
        connection: Weak<dyn Connection>,
        callbacks: Rc<dyn ServerConnectionCallbacks>,
        settings: Http1Settings,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            connection,
            self_ref: self_ref.clone(),
            callbacks,
            decoder: RefCell::new(MessageDecoder::new(RequestHeaderDecoder::new(settings))),
            active: RefCell::new(None),
            read_paused: Cell::new(false),
        })
    }

    fn active(&self) -> Option<Rc<ServerStream>> {
        self.active.borrow().clone()
    }

    fn open(&self) -> bool {
        self.connection.upgrade().is_some_and(|c| c.state() == ConnectionState::Open)
    }

    /// Retires the active stream once both directions are done.
    fn on_stream_progress(&self) {
        let Some(active) = self.active().filter(|stream| stream.is_finished()) else {
            return;
        };
        self.active.borrow_mut().take();
        active.request_decoder.borrow_mut().take();
        let Some(connection) = self.connection.upgrade() else {
            return;
        };

        if active.close_after_response.get() {
            debug!(connection_id = connection.id(), "closing after response");
            connection.close(ConnectionCloseType::FlushWrite);
        } else if self.read_paused.replace(false) {
            trace!(connection_id = connection.id(), "resuming pipelined requests");
            connection.read_disable(false);
        }
    }

    fn start_stream(&self, headers: &Headers, end_stream: bool) -> Rc<ServerStream> {
        let stream = Rc::new(ServerStream {
            codec: self.self_ref.clone(),
            connection: self.connection.clone(),
            stream: Rc::new(Http1Stream::new(self.connection.clone())),
            encoder: MessageEncoder::default(),
            request_decoder: RefCell::new(None),
            head_request: headers.method() == Some(&Method::HEAD),
            request_complete: Cell::new(end_stream),
            close_after_response: Cell::new(headers.connection_close()),
        });
        *self.active.borrow_mut() = Some(Rc::clone(&stream));

        let request_decoder = self.callbacks.new_stream(Rc::clone(&stream) as Rc<dyn StreamEncoder>);
        *stream.request_decoder.borrow_mut() = Some(request_decoder);
        stream
    }
}

impl CodecConnection for Http1ServerCodec {
    fn dispatch(&self, data: &mut Buffer) -> Result<(), CodecError> {
        let mut body = Buffer::new();

        while self.open() {
            if let Some(active) = self.active()
                && active.request_complete.get()
            {
                if !data.is_empty()
                    && !self.read_paused.replace(true)
                    && let Some(connection) = self.connection.upgrade()
                {
                    trace!(connection_id = connection.id(), "pausing reads until the response completes");
                    connection.read_disable(true);
                }
                break;
            }

            let Some(message) = self.decoder.borrow_mut().decode(data.bytes_mut())? else {
                break;
            };

            match message {
                Message::Header((headers, payload_size)) => {
                    let end_stream = payload_size.is_empty();
                    trace!(method = ?headers.method(), path = ?headers.path(), end_stream, "decoded request head");
                    let stream = self.start_stream(&headers, end_stream);
                    if let Some(decoder) = stream.request_decoder() {
                        decoder.decode_headers(headers, end_stream)?;
                    }
                    if end_stream {
                        self.on_stream_progress();
                    }
                }
                Message::Payload(PayloadItem::Chunk(bytes)) => body.add(&bytes),
                Message::Payload(end) => {
                    let mut chunk = std::mem::take(&mut body);
                    let Some(stream) = self.active() else {
                        continue;
                    };
                    let Some(decoder) = stream.request_decoder() else {
                        continue;
                    };
                    match end {
                        PayloadItem::Trailers(trailers) => {
                            if !chunk.is_empty() {
                                decoder.decode_data(&mut chunk, false)?;
                                if !self.open() {
                                    break;
                                }
                            }
                            stream.request_complete.set(true);
                            decoder.decode_trailers(trailers)?;
                        }
                        _ => {
                            stream.request_complete.set(true);
                            decoder.decode_data(&mut chunk, true)?;
                        }
                    }
                    self.on_stream_progress();
                }
            }
        }

        if !body.is_empty()
            && self.open()
            && let Some(decoder) = self.active().and_then(|stream| stream.request_decoder())
        {
            decoder.decode_data(&mut body, false)?;
        }
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http11
    }

    fn go_away(&self) {}

    fn on_transport_close(&self) {
        let active = self.active.borrow_mut().take();
        if let Some(stream) = active {
            if !stream.is_finished() {
                stream.stream.run_reset_callbacks(StreamResetReason::ConnectionTermination);
            }
            stream.request_decoder.borrow_mut().take();
        }
    }
}

impl ServerCodec for Http1ServerCodec {}

impl StreamEncoder for ServerStream {
    fn encode_headers(&self, headers: &Headers, end_stream: bool) -> Result<(), CodecError> {
        if headers.connection_close() {
            self.close_after_response.set(true);
        }
        let bytes = self.encoder.encode_headers(headers, end_stream, self.head_request)?;
        write_to(&self.connection, bytes)?;
        self.after_encode();
        Ok(())
    }

    fn encode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), CodecError> {
        let bytes = self.encoder.encode_data(data, end_stream)?;
        write_to(&self.connection, bytes)?;
        self.after_encode();
        Ok(())
    }

    fn encode_trailers(&self, trailers: &HeaderMap) -> Result<(), CodecError> {
        let bytes = self.encoder.encode_trailers(trailers)?;
        write_to(&self.connection, bytes)?;
        self.after_encode();
        Ok(())
    }

    fn stream(&self) -> Rc<dyn Stream> {
        Rc::clone(&self.stream) as Rc<dyn Stream>
    }
}

impl fmt::Debug for Http1ServerCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1ServerCodec")
            .field("active", &self.active.borrow().is_some())
            .field("read_paused", &self.read_paused.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StreamCallbacks, StreamFault};
    use http::{HeaderValue, StatusCode, header};
    use micro_proxy_net::event::Dispatcher;
    use micro_proxy_net::mocks::MockConnection;

    /// Echoes each request body once the request is complete, unless `defer` holds the
    /// reply back for the test to send.
    #[derive(Default)]
    struct EchoCallbacks {
        defer: bool,
        retain: bool,
        log: Rc<RefCell<Vec<String>>>,
        streams: Rc<RefCell<Vec<Rc<EchoStream>>>>,
    }

    struct EchoStream {
        encoder: Rc<dyn StreamEncoder>,
        defer: bool,
        retain: bool,
        body: RefCell<Buffer>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl EchoStream {
        fn respond(&self) -> Result<(), CodecError> {
            let mut body = std::mem::take(&mut *self.body.borrow_mut());
            let headers = Headers::response(StatusCode::OK)
                .with_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            self.encoder.encode_headers(&headers, body.is_empty())?;
            if !body.is_empty() {
                self.encoder.encode_data(&mut body, true)?;
            }
            Ok(())
        }

        fn complete(&self) -> Result<(), StreamFault> {
            if !self.defer {
                self.respond().map_err(|_| StreamFault::Unsupported { feature: "reply" })?;
            }
            Ok(())
        }
    }

    impl StreamDecoder for EchoStream {
        fn decode_headers(&self, headers: Headers, end_stream: bool) -> Result<(), StreamFault> {
            self.log.borrow_mut().push(format!("{} {}", headers.method().unwrap(), headers.path().unwrap()));
            if end_stream { self.complete() } else { Ok(()) }
        }

        fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), StreamFault> {
            if self.retain {
                self.body.borrow_mut().add(data.as_slice());
            } else {
                self.body.borrow_mut().move_from(data);
            }
            if end_stream { self.complete() } else { Ok(()) }
        }

        fn decode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamFault> {
            self.log.borrow_mut().push(format!("trailers {}", trailers.len()));
            self.complete()
        }
    }

    impl StreamCallbacks for EchoStream {
        fn on_reset_stream(&self, reason: StreamResetReason) {
            self.log.borrow_mut().push(format!("reset {reason}"));
        }
    }

    impl ServerConnectionCallbacks for EchoCallbacks {
        fn new_stream(&self, response_encoder: Rc<dyn StreamEncoder>) -> Rc<dyn StreamDecoder> {
            let stream = Rc::new(EchoStream {
                encoder: Rc::clone(&response_encoder),
                defer: self.defer,
                retain: self.retain,
                body: RefCell::default(),
                log: Rc::clone(&self.log),
            });
            response_encoder.stream().add_callbacks(Rc::downgrade(&stream) as Weak<dyn StreamCallbacks>);
            self.streams.borrow_mut().push(Rc::clone(&stream));
            stream
        }
    }

    struct Harness {
        _dispatcher: Dispatcher,
        _connection: Rc<dyn Connection>,
        written: Rc<RefCell<String>>,
        log: Rc<RefCell<Vec<String>>>,
        streams: Rc<RefCell<Vec<Rc<EchoStream>>>>,
        codec: Rc<Http1ServerCodec>,
    }

    fn harness(defer: bool, configure: impl FnOnce(&mut MockConnection)) -> Harness {
        harness_with(EchoCallbacks { defer, ..EchoCallbacks::default() }, configure)
    }

    fn harness_with(callbacks: EchoCallbacks, configure: impl FnOnce(&mut MockConnection)) -> Harness {
        let dispatcher = Dispatcher::new().unwrap();
        let written = Rc::new(RefCell::new(String::new()));
        let mut connection = MockConnection::nice(dispatcher.clone());
        connection.checkpoint();
        connection.expect_state().return_const(ConnectionState::Open);
        connection.expect_id().return_const(3u64);
        let sink = Rc::clone(&written);
        connection.expect_write().returning_st(move |data| {
            sink.borrow_mut().push_str(&data.to_string());
            data.clear();
        });
        configure(&mut connection);
        let connection: Rc<dyn Connection> = Rc::new(connection);

        let log = Rc::clone(&callbacks.log);
        let streams = Rc::clone(&callbacks.streams);
        let codec = Http1ServerCodec::new(Rc::downgrade(&connection), Rc::new(callbacks), Http1Settings::default());
        Harness { _dispatcher: dispatcher, _connection: connection, written, log, streams, codec }
    }

    #[test]
    fn pipelined_request_bodies_do_not_share_bytes() {
        let h = harness_with(EchoCallbacks { retain: true, ..EchoCallbacks::default() }, |_| {});

        let mut data = Buffer::from(
            "POST /a HTTP/1.1\r\ncontent-length: 5\r\n\r\nhelloPOST /b HTTP/1.1\r\ncontent-length: 3\r\n\r\nabc",
        );
        h.codec.dispatch(&mut data).unwrap();

        assert_eq!(*h.log.borrow(), vec!["POST /a", "POST /b"]);
        assert_eq!(
            *h.written.borrow(),
            "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhelloHTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nabc"
        );
    }

    #[test]
    fn keep_alive_requests_in_sequence() {
        let h = harness(false, |_| {});

        h.codec.dispatch(&mut Buffer::from("GET /status HTTP/1.1\r\nhost: a\r\n\r\n")).unwrap();
        h.codec.dispatch(&mut Buffer::from("POST /echo HTTP/1.1\r\ncontent-length: 5\r\n\r\nhel")).unwrap();
        h.codec.dispatch(&mut Buffer::from("lo")).unwrap();

        assert_eq!(*h.log.borrow(), vec!["GET /status", "POST /echo"]);
        assert_eq!(
            *h.written.borrow(),
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello"
        );
        assert!(h.codec.active().is_none());
    }

    #[test]
    fn chunked_request_with_trailers() {
        let h = harness(false, |_| {});
        let mut data =
            Buffer::from("PUT /x HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nx-a: 1\r\n\r\n");
        h.codec.dispatch(&mut data).unwrap();

        assert_eq!(*h.log.borrow(), vec!["PUT /x", "trailers 1"]);
        assert!(h.written.borrow().ends_with("content-length: 3\r\n\r\nabc"));
        assert!(data.is_empty());
    }

    #[test]
    fn connection_close_request_closes_after_response() {
        let h = harness(false, |connection| {
            connection.expect_close().withf(|t| *t == ConnectionCloseType::FlushWrite).times(1).return_const(());
        });
        h.codec.dispatch(&mut Buffer::from("GET / HTTP/1.1\r\nconnection: close\r\n\r\n")).unwrap();
        assert!(h.written.borrow().starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn pipelined_request_waits_for_the_open_response() {
        let h = harness(true, |connection| {
            let mut seq = mockall::Sequence::new();
            connection.expect_read_disable().withf(|d| *d).times(1).in_sequence(&mut seq).return_const(());
            connection.expect_read_disable().withf(|d| !*d).times(1).in_sequence(&mut seq).return_const(());
        });

        let mut data = Buffer::from("GET /slow HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n");
        h.codec.dispatch(&mut data).unwrap();
        assert_eq!(*h.log.borrow(), vec!["GET /slow"]);
        assert_eq!(data.to_string(), "GET /next HTTP/1.1\r\n\r\n");

        let slow = Rc::clone(&h.streams.borrow()[0]);
        slow.respond().unwrap();
        h.codec.dispatch(&mut data).unwrap();

        assert_eq!(*h.log.borrow(), vec!["GET /slow", "GET /next"]);
        assert!(data.is_empty());
    }

    #[test]
    fn transport_close_resets_an_open_stream() {
        let h = harness(false, |_| {});
        h.codec.dispatch(&mut Buffer::from("POST /echo HTTP/1.1\r\ncontent-length: 10\r\n\r\nabc")).unwrap();
        h.codec.on_transport_close();
        h.codec.on_transport_close();
        assert_eq!(*h.log.borrow(), vec!["POST /echo", "reset connection termination"]);
    }
}
