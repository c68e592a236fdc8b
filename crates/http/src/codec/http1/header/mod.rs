//! HTTP/1.1 message heads
//!
//! [`RequestHeaderDecoder`] and [`ResponseHeaderDecoder`] parse a head with `httparse` and
//! decide how the payload that follows is framed. [`HeaderEncoder`] writes request and
//! response heads and the framing header that matches the chosen [`PayloadSize`].
//!
//! Both decoders record the byte ranges of every field while the head is borrowed by
//! `httparse`, then split the head off the input once and slice names and values out of
//! that single allocation.
//!
//! [`PayloadSize`]: crate::protocol::PayloadSize

mod header_encoder;
mod request_decoder;
mod response_decoder;

pub use header_encoder::HeaderEncoder;
pub use request_decoder::RequestHeaderDecoder;
pub use response_decoder::ResponseHeaderDecoder;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, header};

use crate::protocol::ParseError;

/// Byte ranges of one field's name and value within the head.
#[derive(Clone, Copy, Default)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>]) -> Vec<HeaderIndex> {
        let bytes_ptr = bytes.as_ptr() as usize;
        headers
            .iter()
            .map(|header| {
                let name_start = header.name.as_ptr() as usize - bytes_ptr;
                let value_start = header.value.as_ptr() as usize - bytes_ptr;
                HeaderIndex {
                    name: (name_start, name_start + header.name.len()),
                    value: (value_start, value_start + header.value.len()),
                }
            })
            .collect()
    }
}

fn build_fields(head: &Bytes, indices: &[HeaderIndex]) -> Result<HeaderMap, ParseError> {
    let mut fields = HeaderMap::with_capacity(indices.len());
    for index in indices {
        let name = HeaderName::from_bytes(&head[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_maybe_shared(head.slice(index.value.0..index.value.1))
            .map_err(ParseError::invalid_header)?;
        fields.append(name, value);
    }
    Ok(fields)
}

fn map_httparse_error(e: httparse::Error, max_headers: usize) -> ParseError {
    match e {
        httparse::Error::TooManyHeaders => ParseError::too_many_headers(max_headers),
        e => ParseError::invalid_header(e.to_string()),
    }
}

/// True if `chunked` is the final transfer coding.
fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value
        && let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next()
    {
        return bytes.trim_ascii().eq_ignore_ascii_case(CHUNKED);
    }
    false
}

fn has_connection_token(fields: &HeaderMap, token: &str) -> bool {
    fields
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The `content-length` of a head; several fields must agree.
fn content_length(fields: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in fields.get_all(header::CONTENT_LENGTH) {
        let value = value.to_str().map_err(ParseError::invalid_content_length)?;
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|e| ParseError::invalid_content_length(format!("{value:?}: {e}")))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseError::invalid_content_length("conflicting content-length values"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}
