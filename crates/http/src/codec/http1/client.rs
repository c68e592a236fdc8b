use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use http::{HeaderMap, Method};
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::Connection;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use super::header::ResponseHeaderDecoder;
use super::message_decoder::MessageDecoder;
use super::stream::{Http1Stream, MessageEncoder};
use crate::codec::{ClientCodec, CodecConnection, Http1Settings, connection_closed, write_to};
use crate::protocol::{
    CodecError, Headers, Message, ParseError, PayloadItem, PayloadSize, Protocol, Stream, StreamDecoder,
    StreamEncoder, StreamResetReason,
};

/// The client side of HTTP/1.1.
///
/// Requests may be pipelined; responses are matched to requests in the order the
/// requests were opened.
pub struct Http1ClientCodec {
    connection: Weak<dyn Connection>,
    decoder: RefCell<MessageDecoder<ResponseHeaderDecoder>>,
    pending_responses: RefCell<VecDeque<Rc<ClientStream>>>,
}

struct ClientStream {
    connection: Weak<dyn Connection>,
    stream: Rc<Http1Stream>,
    encoder: MessageEncoder,
    response_decoder: Rc<dyn StreamDecoder>,
    head_request: Cell<bool>,
}

impl Http1ClientCodec {
    pub fn new(connection: Weak<dyn Connection>, settings: Http1Settings) -> Rc<Self> {
        Rc::new(Self {
            connection,
            decoder: RefCell::new(MessageDecoder::new(ResponseHeaderDecoder::new(settings))),
            pending_responses: RefCell::new(VecDeque::new()),
        })
    }

    fn front(&self) -> Option<Rc<ClientStream>> {
        self.pending_responses.borrow().front().cloned()
    }

    fn pop_front(&self) {
        self.pending_responses.borrow_mut().pop_front();
    }

    fn closed(&self) -> bool {
        connection_closed(&self.connection)
    }

    fn decode_next(
        &self,
        data: &mut Buffer,
        front: Option<&ClientStream>,
    ) -> Result<Option<Message<(Headers, PayloadSize)>>, ParseError> {
        let mut decoder = self.decoder.borrow_mut();
        if !decoder.in_payload() {
            decoder.header_decoder_mut().set_head_request(front.is_some_and(|s| s.head_request.get()));
        }
        decoder.decode(data.bytes_mut())
    }
}

impl CodecConnection for Http1ClientCodec {
    fn dispatch(&self, data: &mut Buffer) -> Result<(), CodecError> {
        let mut body = Buffer::new();
        let mut front = None;

        while !self.closed() {
            front = self.front();
            let message = match self.decode_next(data, front.as_deref()) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    if matches!(e, ParseError::TooLargeHeader { .. })
                        && let Some(stream) = &front
                    {
                        self.pop_front();
                        stream.stream.run_reset_callbacks(StreamResetReason::Overflow);
                    }
                    return Err(e.into());
                }
            };

            let Some(stream) = &front else {
                return Err(ParseError::unexpected_message("response without a pending request").into());
            };

            match message {
                Message::Header((headers, payload_size)) => {
                    let end_stream = payload_size.is_empty();
                    trace!(status = ?headers.status(), end_stream, "decoded response head");
                    if end_stream {
                        self.pop_front();
                    }
                    stream.response_decoder.decode_headers(headers, end_stream)?;
                }
                Message::Payload(PayloadItem::Chunk(bytes)) => body.add(&bytes),
                Message::Payload(PayloadItem::Eof) => {
                    self.pop_front();
                    stream.response_decoder.decode_data(&mut std::mem::take(&mut body), true)?;
                }
                Message::Payload(PayloadItem::Trailers(trailers)) => {
                    if !body.is_empty() {
                        stream.response_decoder.decode_data(&mut std::mem::take(&mut body), false)?;
                        if self.closed() {
                            break;
                        }
                    }
                    self.pop_front();
                    stream.response_decoder.decode_trailers(trailers)?;
                }
            }
        }

        if !body.is_empty()
            && !self.closed()
            && let Some(stream) = front
        {
            stream.response_decoder.decode_data(&mut std::mem::take(&mut body), false)?;
        }
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http11
    }

    fn go_away(&self) {}

    fn on_transport_close(&self) {
        if self.decoder.borrow_mut().finish_until_close()
            && let Some(stream) = self.front()
        {
            self.pop_front();
            trace!("response body ended by connection close");
            if let Err(e) = stream.response_decoder.decode_data(&mut Buffer::new(), true) {
                debug!(cause = %e, "response decoder refused close-delimited end");
            }
        }

        let remaining: Vec<_> = self.pending_responses.borrow_mut().drain(..).collect();
        for stream in remaining {
            stream.stream.run_reset_callbacks(StreamResetReason::ConnectionTermination);
        }
    }
}

impl ClientCodec for Http1ClientCodec {
    fn new_stream(&self, response_decoder: Rc<dyn StreamDecoder>) -> Rc<dyn StreamEncoder> {
        let stream = Rc::new(ClientStream {
            connection: self.connection.clone(),
            stream: Rc::new(Http1Stream::new(self.connection.clone())),
            encoder: MessageEncoder::default(),
            response_decoder,
            head_request: Cell::new(false),
        });
        self.pending_responses.borrow_mut().push_back(Rc::clone(&stream));
        stream
    }
}

impl StreamEncoder for ClientStream {
    fn encode_headers(&self, headers: &Headers, end_stream: bool) -> Result<(), CodecError> {
        self.head_request.set(headers.method() == Some(&Method::HEAD));
        let bytes = self.encoder.encode_headers(headers, end_stream, false)?;
        write_to(&self.connection, bytes)
    }

    fn encode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), CodecError> {
        let bytes = self.encoder.encode_data(data, end_stream)?;
        write_to(&self.connection, bytes)
    }

    fn encode_trailers(&self, trailers: &HeaderMap) -> Result<(), CodecError> {
        let bytes = self.encoder.encode_trailers(trailers)?;
        write_to(&self.connection, bytes)
    }

    fn stream(&self) -> Rc<dyn Stream> {
        Rc::clone(&self.stream) as Rc<dyn Stream>
    }
}

impl fmt::Debug for Http1ClientCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1ClientCodec").field("pending_responses", &self.pending_responses.borrow().len()).finish()
    }
}
