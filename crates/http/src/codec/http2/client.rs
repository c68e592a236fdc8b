use std::fmt;
use std::rc::{Rc, Weak};

use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::Connection;
use tracing::debug;

use super::stream::{Http2Core, Http2StreamEncoder};
use crate::codec::{ClientCodec, CodecConnection, Http2Settings};
use crate::protocol::{CodecError, Protocol, StreamDecoder, StreamEncoder};

/// The client side of HTTP/2. The preface and SETTINGS go out on construction.
pub struct Http2ClientCodec {
    core: Rc<Http2Core>,
}

impl Http2ClientCodec {
    pub fn new(connection: Weak<dyn Connection>, settings: Http2Settings) -> Rc<Self> {
        let core = Http2Core::client(connection, settings);
        if let Err(e) = core.flush() {
            debug!(cause = %e, "connection preface not written");
        }
        Rc::new(Self { core })
    }

    /// Streams that still send or receive.
    pub fn active_streams(&self) -> usize {
        self.core.num_streams()
    }
}

impl CodecConnection for Http2ClientCodec {
    fn dispatch(&self, data: &mut Buffer) -> Result<(), CodecError> {
        self.core.dispatch(data)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn go_away(&self) {
        self.core.go_away();
    }

    fn on_transport_close(&self) {
        self.core.on_transport_close();
    }
}

impl ClientCodec for Http2ClientCodec {
    fn new_stream(&self, response_decoder: Rc<dyn StreamDecoder>) -> Rc<dyn StreamEncoder> {
        let stream = self.core.new_stream(Some(response_decoder));
        Rc::new(Http2StreamEncoder::new(stream))
    }
}

impl fmt::Debug for Http2ClientCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2ClientCodec").field("core", &self.core).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use bytes::{Bytes, BytesMut};
    use http::{HeaderMap, HeaderValue, Method, header};
    use micro_proxy_net::event::Dispatcher;
    use micro_proxy_net::mocks::MockConnection;
    use micro_proxy_net::network::ConnectionState;

    use super::*;
    use crate::codec::http2::hpack::HeaderField;
    use crate::codec::http2::{ErrorCode, Event, Http2Error, Session};
    use crate::protocol::{Headers, StreamCallbacks, StreamFault, StreamResetReason};

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
        resets: RefCell<Vec<StreamResetReason>>,
    }

    impl StreamDecoder for Recorder {
        fn decode_headers(&self, headers: Headers, end_stream: bool) -> Result<(), StreamFault> {
            let status = headers.status().map_or(0, |s| s.as_u16());
            self.events.borrow_mut().push(format!("headers {status} {end_stream}"));
            Ok(())
        }

        fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), StreamFault> {
            self.events.borrow_mut().push(format!("data {data} {end_stream}"));
            data.clear();
            Ok(())
        }

        fn decode_trailers(&self, trailers: HeaderMap) -> Result<(), StreamFault> {
            self.events.borrow_mut().push(format!("trailers {}", trailers.len()));
            Ok(())
        }
    }

    impl StreamCallbacks for Recorder {
        fn on_reset_stream(&self, reason: StreamResetReason) {
            self.resets.borrow_mut().push(reason);
        }
    }

    /// A client codec over a mock connection, talking to a server [`Session`].
    struct Harness {
        _dispatcher: Dispatcher,
        _connection: Rc<dyn Connection>,
        written: Rc<RefCell<BytesMut>>,
        server: Session,
        codec: Rc<Http2ClientCodec>,
    }

    impl Harness {
        fn new() -> Self {
            let dispatcher = Dispatcher::new().unwrap();
            let written = Rc::new(RefCell::new(BytesMut::new()));
            let mut connection = MockConnection::nice(dispatcher.clone());
            connection.checkpoint();
            connection.expect_state().return_const(ConnectionState::Open);
            connection.expect_id().return_const(5u64);
            let sink = Rc::clone(&written);
            connection.expect_write().returning_st(move |data| {
                sink.borrow_mut().extend_from_slice(data.as_slice());
                data.clear();
            });
            let connection: Rc<dyn Connection> = Rc::new(connection);

            let codec = Http2ClientCodec::new(Rc::downgrade(&connection), Http2Settings::default());
            let mut harness = Self {
                _dispatcher: dispatcher,
                _connection: connection,
                written,
                server: Session::server(Http2Settings::default()),
                codec,
            };
            harness.to_server().unwrap();
            harness.to_client().unwrap();
            harness.to_server().unwrap();
            harness
        }

        fn to_server(&mut self) -> Result<(), Http2Error> {
            let mut bytes = self.written.borrow_mut().split();
            self.server.recv(&mut bytes)
        }

        fn to_client(&mut self) -> Result<(), CodecError> {
            let mut data = Buffer::from(self.server.take_pending_send());
            self.codec.dispatch(&mut data)
        }

        fn server_events(&mut self) -> Vec<Event> {
            std::iter::from_fn(|| self.server.poll_event()).collect()
        }

        fn open(&self) -> (Rc<Recorder>, Rc<dyn StreamEncoder>) {
            let recorder = Rc::new(Recorder::default());
            let encoder = self.codec.new_stream(Rc::clone(&recorder) as Rc<dyn StreamDecoder>);
            encoder.stream().add_callbacks(Rc::downgrade(&recorder) as Weak<dyn StreamCallbacks>);
            (recorder, encoder)
        }
    }

    fn field(name: &'static str, value: &'static str) -> HeaderField {
        HeaderField::new(name, value)
    }

    #[test]
    fn request_and_response_on_one_stream() {
        let mut h = Harness::new();
        assert!(h.server_events().is_empty());

        let (recorder, encoder) = h.open();
        let headers = Headers::request(Method::POST, "/echo", "localhost")
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        encoder.encode_headers(&headers, false).unwrap();
        encoder.encode_data(&mut Buffer::from("hello"), true).unwrap();
        h.to_server().unwrap();

        assert_eq!(h.server_events(), vec![
            Event::Headers {
                stream_id: 1,
                fields: vec![
                    field(":method", "POST"),
                    field(":scheme", "http"),
                    field(":authority", "localhost"),
                    field(":path", "/echo"),
                    field("content-type", "text/plain"),
                ],
                end_stream: false,
            },
            Event::Data { stream_id: 1, data: Bytes::from_static(b"hello"), end_stream: true },
        ]);

        h.server.send_headers(1, &[field(":status", "100")], false).unwrap();
        h.server.send_headers(1, &[field(":status", "200")], false).unwrap();
        h.server.send_data(1, Bytes::from_static(b"hello"), false).unwrap();
        h.server.send_trailers(1, vec![field("x-checksum", "5")]).unwrap();
        h.to_client().unwrap();

        assert_eq!(*recorder.events.borrow(), vec!["headers 200 false", "data hello false", "trailers 1"]);
        assert!(recorder.resets.borrow().is_empty());
        assert_eq!(h.codec.active_streams(), 0);
    }

    #[test]
    fn concurrent_streams_complete_independently() {
        let mut h = Harness::new();
        let (first, first_encoder) = h.open();
        let (second, second_encoder) = h.open();

        second_encoder.encode_headers(&Headers::request(Method::GET, "/b", "localhost"), true).unwrap();
        first_encoder.encode_headers(&Headers::request(Method::GET, "/a", "localhost"), true).unwrap();
        h.to_server().unwrap();
        assert_eq!(h.codec.active_streams(), 2);

        h.server.send_headers(3, &[field(":status", "200")], false).unwrap();
        h.server.send_headers(1, &[field(":status", "204")], true).unwrap();
        h.server.send_data(3, Bytes::from_static(b"late"), true).unwrap();
        h.to_client().unwrap();

        assert_eq!(*first.events.borrow(), vec!["headers 200 false", "data late true"]);
        assert_eq!(*second.events.borrow(), vec!["headers 204 true"]);
    }

    #[test]
    fn peer_reset_reaches_only_that_stream() {
        let mut h = Harness::new();
        let (first, first_encoder) = h.open();
        let (second, second_encoder) = h.open();
        first_encoder.encode_headers(&Headers::request(Method::GET, "/a", "localhost"), true).unwrap();
        second_encoder.encode_headers(&Headers::request(Method::GET, "/b", "localhost"), true).unwrap();
        h.to_server().unwrap();

        h.server.reset_stream(1, ErrorCode::InternalError);
        h.server.send_headers(3, &[field(":status", "200")], true).unwrap();
        h.to_client().unwrap();

        assert_eq!(*first.resets.borrow(), vec![StreamResetReason::RemoteReset]);
        assert!(first.events.borrow().is_empty());
        assert_eq!(*second.events.borrow(), vec!["headers 200 true"]);
        assert!(first_encoder.encode_data(&mut Buffer::from("x"), true).is_err());
    }

    #[test]
    fn local_reset_sends_rst_stream() {
        let mut h = Harness::new();
        let (recorder, encoder) = h.open();
        encoder.encode_headers(&Headers::request(Method::GET, "/", "localhost"), false).unwrap();
        h.to_server().unwrap();
        h.server_events();

        encoder.stream().reset_stream(StreamResetReason::LocalReset);
        encoder.stream().reset_stream(StreamResetReason::LocalReset);
        h.to_server().unwrap();

        assert_eq!(*recorder.resets.borrow(), vec![StreamResetReason::LocalReset]);
        assert_eq!(h.server_events(), vec![Event::Reset { stream_id: 1, reason: StreamResetReason::RemoteReset }]);
        assert_eq!(h.codec.active_streams(), 0);
    }

    #[test]
    fn malformed_response_resets_the_stream() {
        let mut h = Harness::new();
        let (recorder, encoder) = h.open();
        encoder.encode_headers(&Headers::request(Method::GET, "/", "localhost"), true).unwrap();
        h.to_server().unwrap();

        h.server.send_headers(1, &[field("server", "no-status")], true).unwrap();
        h.to_client().unwrap();

        assert!(recorder.events.borrow().is_empty());
        assert_eq!(*recorder.resets.borrow(), vec![StreamResetReason::LocalReset]);
    }

    #[test]
    fn data_before_the_response_head_resets_the_stream() {
        let mut h = Harness::new();
        let (recorder, encoder) = h.open();
        encoder.encode_headers(&Headers::request(Method::GET, "/", "localhost"), true).unwrap();
        h.to_server().unwrap();
        h.server_events();

        h.server.send_data(1, Bytes::from_static(b"early"), false).unwrap();
        h.to_client().unwrap();

        assert!(recorder.events.borrow().is_empty());
        assert_eq!(*recorder.resets.borrow(), vec![StreamResetReason::LocalReset]);
        assert_eq!(h.codec.active_streams(), 0);

        h.to_server().unwrap();
        assert_eq!(h.server_events(), vec![Event::Reset { stream_id: 1, reason: StreamResetReason::RemoteReset }]);
    }

    #[test]
    fn transport_close_resets_open_streams() {
        let mut h = Harness::new();
        let (recorder, encoder) = h.open();
        encoder.encode_headers(&Headers::request(Method::GET, "/", "localhost"), true).unwrap();
        h.to_server().unwrap();

        h.codec.on_transport_close();
        assert_eq!(*recorder.resets.borrow(), vec![StreamResetReason::ConnectionTermination]);
    }

    #[test]
    fn goaway_fails_new_streams() {
        let mut h = Harness::new();
        h.codec.go_away();
        h.to_server().unwrap();
        assert_eq!(h.server_events(), vec![Event::GoAway { last_stream_id: 0, code: ErrorCode::NoError }]);

        let (_recorder, encoder) = h.open();
        let result = encoder.encode_headers(&Headers::request(Method::GET, "/", "localhost"), true);
        assert!(matches!(result, Err(CodecError::Http2 { source: Http2Error::GoingAway { .. } })));
    }

    #[test]
    fn connection_error_fails_the_dispatch() {
        let h = Harness::new();
        let mut garbage = Buffer::from(&[0u8, 0, 4, 0x8, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        let result = h.codec.dispatch(&mut garbage);
        assert!(matches!(result, Err(CodecError::Http2 { .. })));
    }
}
