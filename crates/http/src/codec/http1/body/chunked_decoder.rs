//! Chunked transfer coding,
//! [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112.html#name-chunked-transfer-coding).
//!
//! Chunk extensions are skipped. The trailer section after the last chunk is parsed into
//! a header map and yielded as [`PayloadItem::Trailers`] in place of `Eof`.

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};

const MAX_TRAILER_BYTES: usize = 8 * 1024;

const MAX_TRAILERS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
    /// Bytes left in the current chunk, or the size being parsed
    chunk_size: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, chunk_size: 0 }
    }

    /// Consumes one framing byte and moves the state machine. Chunk data is handled by
    /// [`Self::take_data`].
    fn advance(&mut self, byte: u8) -> Result<State, ParseError> {
        let next = match (self.state, byte) {
            (State::Size, b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F') => {
                let digit = hex_value(byte);
                self.chunk_size = self
                    .chunk_size
                    .checked_mul(16)
                    .and_then(|size| size.checked_add(digit))
                    .ok_or_else(|| ParseError::invalid_body("chunk size overflows"))?;
                State::Size
            }
            // only whitespace, an extension or the line end may follow the size
            (State::Size | State::SizeWhitespace, b'\t' | b' ') => State::SizeWhitespace,
            (State::Size | State::SizeWhitespace, b';') => State::Extension,
            (State::Size | State::SizeWhitespace | State::Extension, b'\r') => State::SizeLf,
            (State::Extension, b'\n') => return Err(ParseError::invalid_body("bare LF in a chunk extension")),
            (State::Extension, _) => State::Extension,
            (State::SizeLf, b'\n') if self.chunk_size == 0 => State::Trailers,
            (State::SizeLf, b'\n') => State::Data,
            (State::DataCr, b'\r') => State::DataLf,
            (State::DataLf, b'\n') => State::Size,
            (State::Size | State::SizeWhitespace, _) => return Err(ParseError::invalid_body("invalid chunk size")),
            (state, _) => return Err(ParseError::invalid_body(format!("unexpected byte in chunk framing ({state:?})"))),
        };
        Ok(next)
    }

    fn take_data(&mut self, src: &mut BytesMut) -> Bytes {
        let take = usize::try_from(self.chunk_size).map_or(src.len(), |size| size.min(src.len()));
        self.chunk_size -= take as u64;
        if self.chunk_size == 0 {
            self.state = State::DataCr;
        }
        src.split_to(take).freeze()
    }
}

fn hex_value(byte: u8) -> u64 {
    let value = match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        _ => byte - b'A' + 10,
    };
    u64::from(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Hex chunk size
    Size,
    /// Whitespace after the size
    SizeWhitespace,
    /// Skipped chunk extensions
    Extension,
    /// LF ending the size line
    SizeLf,
    Data,
    DataCr,
    DataLf,
    /// The trailer section and the final empty line
    Trailers,
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::End => {
                    trace!("chunked body complete");
                    return Ok(Some(PayloadItem::Eof));
                }
                State::Trailers => {
                    let item = read_trailers(src)?;
                    if item.is_some() {
                        self.state = State::End;
                    }
                    return Ok(item);
                }
                State::Data if !src.is_empty() => {
                    let data = self.take_data(src);
                    trace!(len = data.len(), "read chunk data");
                    return Ok(Some(PayloadItem::Chunk(data)));
                }
                _ if src.is_empty() => return Ok(None),
                _ => {
                    let byte = src.get_u8();
                    self.state = self.advance(byte)?;
                }
            }
        }
    }
}

/// Parses the trailer section; an empty one is plain `Eof`.
fn read_trailers(src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
    let mut parsed = [httparse::EMPTY_HEADER; MAX_TRAILERS];
    let (consumed, fields) = match httparse::parse_headers(src, &mut parsed) {
        Ok(Status::Complete((consumed, headers))) => {
            let mut fields = HeaderMap::with_capacity(headers.len());
            for header in headers {
                let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::invalid_header)?;
                let value = HeaderValue::from_bytes(header.value).map_err(ParseError::invalid_header)?;
                fields.append(name, value);
            }
            (consumed, fields)
        }
        Ok(Status::Partial) => {
            ensure!(src.len() <= MAX_TRAILER_BYTES, ParseError::too_large_header(src.len(), MAX_TRAILER_BYTES));
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::too_many_headers(MAX_TRAILERS)),
        Err(e) => return Err(ParseError::invalid_header(e)),
    };
    ensure!(consumed <= MAX_TRAILER_BYTES, ParseError::too_large_header(consumed, MAX_TRAILER_BYTES));

    src.advance(consumed);
    if fields.is_empty() {
        Ok(Some(PayloadItem::Eof))
    } else {
        trace!(count = fields.len(), "read chunked trailers");
        Ok(Some(PayloadItem::Trailers(fields)))
    }
}
