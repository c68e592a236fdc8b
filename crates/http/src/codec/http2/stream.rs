//! The part of the HTTP/2 codecs shared by both roles: a [`Session`] bound to a network
//! connection, and the streams handed to the upper layer.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use http::HeaderMap;
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::Connection;
use tracing::{debug, trace};

use super::error::ErrorCode;
use super::headers::{decode_head, decode_trailers, head_fields, trailer_fields};
use super::hpack::HeaderField;
use super::session::{Event, Role, Session};
use crate::codec::{Http2Settings, ServerConnectionCallbacks, connection_closed, write_to};
use crate::protocol::{
    CodecError, Headers, SendError, Stream, StreamCallbackHelper, StreamCallbacks, StreamDecoder, StreamEncoder,
    StreamResetReason,
};

pub(crate) struct Http2Core {
    connection: Weak<dyn Connection>,
    self_ref: Weak<Self>,
    session: RefCell<Session>,
    streams: RefCell<HashMap<u32, Rc<Http2Stream>>>,
    server_callbacks: Option<Rc<dyn ServerConnectionCallbacks>>,
}

/// One HTTP/2 stream. Client streams get their id when the request head is encoded.
pub(crate) struct Http2Stream {
    core: Weak<Http2Core>,
    id: Cell<u32>,
    decoder: RefCell<Option<Rc<dyn StreamDecoder>>>,
    /// The message head was received; a later header block carries trailers.
    head_received: Cell<bool>,
    remote_complete: Cell<bool>,
    local_complete: Cell<bool>,
    callbacks: StreamCallbackHelper,
}

/// The [`StreamEncoder`] handed out for an [`Http2Stream`].
pub(crate) struct Http2StreamEncoder {
    stream: Rc<Http2Stream>,
}

impl Http2Core {
    pub(crate) fn client(connection: Weak<dyn Connection>, settings: Http2Settings) -> Rc<Self> {
        Self::new(connection, Session::client(settings), None)
    }

    pub(crate) fn server(
        connection: Weak<dyn Connection>,
        callbacks: Rc<dyn ServerConnectionCallbacks>,
        settings: Http2Settings,
    ) -> Rc<Self> {
        Self::new(connection, Session::server(settings), Some(callbacks))
    }

    fn new(
        connection: Weak<dyn Connection>,
        session: Session,
        server_callbacks: Option<Rc<dyn ServerConnectionCallbacks>>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            connection,
            self_ref: self_ref.clone(),
            session: RefCell::new(session),
            streams: RefCell::new(HashMap::new()),
            server_callbacks,
        })
    }

    fn role(&self) -> Role {
        self.session.borrow().role()
    }

    fn closed(&self) -> bool {
        connection_closed(&self.connection)
    }

    /// Writes whatever the session has queued.
    pub(crate) fn flush(&self) -> Result<(), CodecError> {
        let pending = self.session.borrow_mut().take_pending_send();
        write_to(&self.connection, pending)
    }

    fn stream(&self, stream_id: u32) -> Option<Rc<Http2Stream>> {
        self.streams.borrow().get(&stream_id).cloned()
    }

    pub(crate) fn new_stream(&self, decoder: Option<Rc<dyn StreamDecoder>>) -> Rc<Http2Stream> {
        Rc::new(Http2Stream {
            core: self.self_ref.clone(),
            id: Cell::new(0),
            decoder: RefCell::new(decoder),
            head_received: Cell::new(false),
            remote_complete: Cell::new(false),
            local_complete: Cell::new(false),
            callbacks: StreamCallbackHelper::default(),
        })
    }

    pub(crate) fn num_streams(&self) -> usize {
        self.streams.borrow().len()
    }

    pub(crate) fn dispatch(&self, data: &mut Buffer) -> Result<(), CodecError> {
        let received = self.session.borrow_mut().recv(data.bytes_mut());
        if let Err(e) = received {
            if let Err(flush_error) = self.flush() {
                debug!(cause = %flush_error, "goaway not written");
            }
            return Err(e.into());
        }

        while !self.closed() {
            let Some(event) = self.session.borrow_mut().poll_event() else {
                break;
            };
            self.deliver(event)?;
        }

        if self.closed() {
            return Ok(());
        }
        self.flush()
    }

    fn deliver(&self, event: Event) -> Result<(), CodecError> {
        match event {
            Event::Headers { stream_id, fields, end_stream } => self.on_headers(stream_id, fields, end_stream)?,
            Event::Data { stream_id, data, end_stream } => {
                let Some(stream) = self.stream(stream_id) else {
                    trace!(stream_id, "data for a retired stream");
                    return Ok(());
                };
                if !stream.head_received.get() {
                    self.malformed(&stream, "data before the response head");
                    return Ok(());
                }
                if end_stream {
                    stream.remote_complete.set(true);
                    self.retire_if_complete(&stream);
                }
                if let Some(decoder) = stream.decoder() {
                    decoder.decode_data(&mut Buffer::from(data), end_stream)?;
                }
            }
            Event::Reset { stream_id, reason } => {
                let removed = self.streams.borrow_mut().remove(&stream_id);
                if let Some(stream) = removed {
                    debug!(stream_id, reason = %reason, "stream reset");
                    stream.callbacks.run_reset_callbacks(reason);
                }
            }
            Event::GoAway { last_stream_id, code } => {
                debug!(last_stream_id, code = %code, "peer is going away");
            }
        }
        Ok(())
    }

    fn on_headers(&self, stream_id: u32, fields: Vec<HeaderField>, end_stream: bool) -> Result<(), CodecError> {
        let stream = match self.stream(stream_id) {
            Some(stream) => stream,
            None if self.role() == Role::Server => return self.on_request_head(stream_id, fields, end_stream),
            None => {
                trace!(stream_id, "headers for a retired stream");
                return Ok(());
            }
        };

        if stream.head_received.get() {
            let trailers = match decode_trailers(fields) {
                Ok(trailers) if end_stream => trailers,
                Ok(_) => {
                    self.malformed(&stream, "trailers must end the stream");
                    return Ok(());
                }
                Err(e) => {
                    self.malformed(&stream, e);
                    return Ok(());
                }
            };
            stream.remote_complete.set(true);
            self.retire_if_complete(&stream);
            if let Some(decoder) = stream.decoder() {
                decoder.decode_trailers(trailers)?;
            }
            return Ok(());
        }

        let headers = match decode_head(fields, Role::Client) {
            Ok(headers) => headers,
            Err(e) => {
                self.malformed(&stream, e);
                return Ok(());
            }
        };
        if headers.status().is_some_and(|s| s.is_informational()) {
            trace!(stream_id, status = ?headers.status(), "skipping interim response");
            return Ok(());
        }

        stream.head_received.set(true);
        if end_stream {
            stream.remote_complete.set(true);
            self.retire_if_complete(&stream);
        }
        if let Some(decoder) = stream.decoder() {
            decoder.decode_headers(headers, end_stream)?;
        }
        Ok(())
    }

    fn on_request_head(&self, stream_id: u32, fields: Vec<HeaderField>, end_stream: bool) -> Result<(), CodecError> {
        let Some(callbacks) = &self.server_callbacks else {
            return Ok(());
        };
        let headers = match decode_head(fields, Role::Server) {
            Ok(headers) => headers,
            Err(e) => {
                debug!(stream_id, cause = %e, "refusing malformed request");
                self.session.borrow_mut().reset_stream(stream_id, ErrorCode::ProtocolError);
                return Ok(());
            }
        };

        let stream = self.new_stream(None);
        stream.id.set(stream_id);
        stream.head_received.set(true);
        stream.remote_complete.set(end_stream);
        self.streams.borrow_mut().insert(stream_id, Rc::clone(&stream));
        trace!(stream_id, method = ?headers.method(), path = ?headers.path(), "new request stream");

        let encoder = Rc::new(Http2StreamEncoder::new(Rc::clone(&stream)));
        let decoder = callbacks.new_stream(encoder as Rc<dyn StreamEncoder>);
        *stream.decoder.borrow_mut() = Some(Rc::clone(&decoder));

        if stream.callbacks.is_reset() {
            return Ok(());
        }
        decoder.decode_headers(headers, end_stream)?;
        Ok(())
    }

    /// Resets a stream whose peer broke the message rules; the connection lives on.
    fn malformed(&self, stream: &Http2Stream, cause: impl fmt::Display) {
        let stream_id = stream.id.get();
        debug!(stream_id, cause = %cause, "malformed message");
        self.session.borrow_mut().reset_stream(stream_id, ErrorCode::ProtocolError);
        self.streams.borrow_mut().remove(&stream_id);
        stream.callbacks.run_reset_callbacks(StreamResetReason::LocalReset);
    }

    fn retire_if_complete(&self, stream: &Http2Stream) {
        if stream.remote_complete.get() && stream.local_complete.get() {
            self.streams.borrow_mut().remove(&stream.id.get());
        }
    }

    pub(crate) fn go_away(&self) {
        self.session.borrow_mut().go_away(ErrorCode::NoError);
        if let Err(e) = self.flush() {
            debug!(cause = %e, "goaway not written");
        }
    }

    pub(crate) fn on_transport_close(&self) {
        let mut remaining: Vec<_> = self.streams.borrow_mut().drain().collect();
        remaining.sort_unstable_by_key(|(stream_id, _)| *stream_id);
        for (stream_id, stream) in remaining {
            trace!(stream_id, "resetting stream on connection close");
            stream.callbacks.run_reset_callbacks(StreamResetReason::ConnectionTermination);
        }
    }

    fn encode_headers(&self, stream: &Rc<Http2Stream>, headers: &Headers, end_stream: bool) -> Result<(), CodecError> {
        let fields = head_fields(headers)?;
        let stream_id = match stream.id.get() {
            0 => {
                let stream_id = self.session.borrow_mut().open_stream()?;
                stream.id.set(stream_id);
                self.streams.borrow_mut().insert(stream_id, Rc::clone(stream));
                stream_id
            }
            stream_id => stream_id,
        };
        self.session.borrow_mut().send_headers(stream_id, &fields, end_stream)?;
        self.after_encode(stream, end_stream)
    }

    fn encode_data(&self, stream: &Http2Stream, data: &mut Buffer, end_stream: bool) -> Result<(), CodecError> {
        self.session.borrow_mut().send_data(stream.id.get(), data.take_bytes(), end_stream)?;
        self.after_encode(stream, end_stream)
    }

    fn encode_trailers(&self, stream: &Http2Stream, trailers: &HeaderMap) -> Result<(), CodecError> {
        self.session.borrow_mut().send_trailers(stream.id.get(), trailer_fields(trailers))?;
        self.after_encode(stream, true)
    }

    fn after_encode(&self, stream: &Http2Stream, end_stream: bool) -> Result<(), CodecError> {
        if end_stream {
            stream.local_complete.set(true);
            self.retire_if_complete(stream);
        }
        self.flush()
    }
}

impl fmt::Debug for Http2Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Core")
            .field("role", &self.role())
            .field("streams", &self.streams.borrow().len())
            .finish()
    }
}

impl Http2Stream {
    fn decoder(&self) -> Option<Rc<dyn StreamDecoder>> {
        self.decoder.borrow().clone()
    }

    fn usable_core(&self) -> Result<Rc<Http2Core>, CodecError> {
        if self.callbacks.is_reset() {
            return Err(SendError::invalid_state("stream was reset").into());
        }
        self.core.upgrade().ok_or(CodecError::ConnectionClosed)
    }
}

impl Stream for Http2Stream {
    fn add_callbacks(&self, callbacks: Weak<dyn StreamCallbacks>) {
        self.callbacks.add_callbacks(callbacks);
    }

    fn reset_stream(&self, reason: StreamResetReason) {
        if !self.callbacks.run_reset_callbacks(reason) {
            return;
        }
        let stream_id = self.id.get();
        let Some(core) = self.core.upgrade().filter(|_| stream_id != 0) else {
            return;
        };
        debug!(stream_id, reason = %reason, "resetting http/2 stream");
        core.session.borrow_mut().reset_stream(stream_id, ErrorCode::Cancel);
        core.streams.borrow_mut().remove(&stream_id);
        if let Err(e) = core.flush() {
            debug!(stream_id, cause = %e, "reset not written");
        }
    }
}

impl fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Stream")
            .field("id", &self.id.get())
            .field("remote_complete", &self.remote_complete.get())
            .field("local_complete", &self.local_complete.get())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Http2StreamEncoder {
    pub(crate) fn new(stream: Rc<Http2Stream>) -> Self {
        Self { stream }
    }
}

impl StreamEncoder for Http2StreamEncoder {
    fn encode_headers(&self, headers: &Headers, end_stream: bool) -> Result<(), CodecError> {
        self.stream.usable_core()?.encode_headers(&self.stream, headers, end_stream)
    }

    fn encode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<(), CodecError> {
        self.stream.usable_core()?.encode_data(&self.stream, data, end_stream)
    }

    fn encode_trailers(&self, trailers: &HeaderMap) -> Result<(), CodecError> {
        self.stream.usable_core()?.encode_trailers(&self.stream, trailers)
    }

    fn stream(&self) -> Rc<dyn Stream> {
        Rc::clone(&self.stream) as Rc<dyn Stream>
    }
}
