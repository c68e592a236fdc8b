use std::cell::{Cell, RefCell};
use std::rc::Weak;

use bytes::BytesMut;
use http::{HeaderMap, StatusCode, header};
use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::{Connection, ConnectionCloseType};
use tokio_util::codec::Encoder;
use tracing::debug;

use super::body::PayloadEncoder;
use super::header::HeaderEncoder;
use crate::protocol::{
    CodecError, Headers, PayloadItem, PayloadSize, SendError, Stream, StreamCallbackHelper, StreamCallbacks,
    StreamResetReason,
};

/// The [`Stream`] half of an HTTP/1.1 exchange. A local reset closes the connection.
#[derive(Debug)]
pub(crate) struct Http1Stream {
    connection: Weak<dyn Connection>,
    callbacks: StreamCallbackHelper,
}

impl Http1Stream {
    pub(crate) fn new(connection: Weak<dyn Connection>) -> Self {
        Self { connection, callbacks: StreamCallbackHelper::default() }
    }

    /// Delivers a reset to the callbacks without touching the connection.
    pub(crate) fn run_reset_callbacks(&self, reason: StreamResetReason) -> bool {
        self.callbacks.run_reset_callbacks(reason)
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.callbacks.is_reset()
    }
}

impl Stream for Http1Stream {
    fn add_callbacks(&self, callbacks: Weak<dyn StreamCallbacks>) {
        self.callbacks.add_callbacks(callbacks);
    }

    fn reset_stream(&self, reason: StreamResetReason) {
        if !self.callbacks.run_reset_callbacks(reason) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            debug!(connection_id = connection.id(), reason = %reason, "http/1.1 stream reset closes the connection");
            connection.close(ConnectionCloseType::NoFlush);
        }
    }
}

/// Frames the outbound message of one stream.
#[derive(Debug, Default)]
pub(crate) struct MessageEncoder {
    payload_encoder: RefCell<Option<PayloadEncoder>>,
    headers_sent: Cell<bool>,
    complete: Cell<bool>,
}

impl MessageEncoder {
    pub(crate) fn is_complete(&self) -> bool {
        self.complete.get()
    }

    /// Encodes a head. `no_body` forces an empty payload, as for a reply to `HEAD`.
    pub(crate) fn encode_headers(&self, headers: &Headers, end_stream: bool, no_body: bool) -> Result<BytesMut, SendError> {
        if self.headers_sent.replace(true) {
            return Err(SendError::invalid_state("headers already encoded"));
        }

        let payload_size = if end_stream || no_body || headers.status().is_some_and(forbids_body) {
            PayloadSize::Empty
        } else if headers.fields().contains_key(header::CONTENT_LENGTH) {
            let length = headers.content_length().ok_or_else(|| SendError::invalid_header("invalid content-length"))?;
            PayloadSize::Length(length)
        } else {
            PayloadSize::Chunked
        };

        let mut dst = BytesMut::new();
        HeaderEncoder.encode((headers, payload_size), &mut dst)?;

        if end_stream {
            self.complete.set(true);
        } else {
            *self.payload_encoder.borrow_mut() = Some(payload_size.into());
        }
        Ok(dst)
    }

    pub(crate) fn encode_data(&self, data: &mut Buffer, end_stream: bool) -> Result<BytesMut, SendError> {
        let mut payload_encoder = self.payload_encoder.borrow_mut();
        let Some(encoder) = payload_encoder.as_mut().filter(|_| !self.complete.get()) else {
            return Err(SendError::invalid_state("no body is open on this stream"));
        };

        let mut dst = BytesMut::new();
        if !data.is_empty() {
            encoder.encode(PayloadItem::Chunk(data.take_bytes()), &mut dst)?;
        }
        if end_stream {
            encoder.encode(PayloadItem::<bytes::Bytes>::Eof, &mut dst)?;
            self.complete.set(true);
        }
        Ok(dst)
    }

    pub(crate) fn encode_trailers(&self, trailers: &HeaderMap) -> Result<BytesMut, CodecError> {
        let mut payload_encoder = self.payload_encoder.borrow_mut();
        let Some(encoder) = payload_encoder.as_mut().filter(|_| !self.complete.get()) else {
            return Err(SendError::invalid_state("no body is open on this stream").into());
        };
        if !encoder.is_chunked() {
            return Err(CodecError::unsupported("trailers on a non-chunked http/1.1 body"));
        }

        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::<bytes::Bytes>::Trailers(trailers.clone()), &mut dst)?;
        self.complete.set(true);
        Ok(dst)
    }
}

fn forbids_body(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}
