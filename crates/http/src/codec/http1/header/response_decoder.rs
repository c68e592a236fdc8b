use bytes::BytesMut;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use super::{HeaderIndex, build_fields, content_length, has_connection_token, is_chunked, map_httparse_error};
use crate::codec::Http1Settings;
use crate::ensure;
use crate::protocol::{Headers, ParseError, PayloadSize};

/// Decodes a response head and picks the framing of the response body.
///
/// Interim `1xx` responses other than `101` are consumed and skipped. The body of a
/// response to `HEAD`, and of `1xx`, `204` and `304` responses, is always empty.
#[derive(Debug, Clone)]
pub struct ResponseHeaderDecoder {
    max_header_bytes: usize,
    max_headers: usize,
    head_request: bool,
}

impl ResponseHeaderDecoder {
    pub fn new(settings: Http1Settings) -> Self {
        Self { max_header_bytes: settings.max_header_bytes(), max_headers: settings.max_headers(), head_request: false }
    }

    /// Whether the next response answers a `HEAD` request.
    pub fn set_head_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }
}

impl Default for ResponseHeaderDecoder {
    fn default() -> Self {
        Self::new(Http1Settings::default())
    }
}

impl Decoder for ResponseHeaderDecoder {
    type Item = (Headers, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }

            let mut parsed_headers = vec![httparse::EMPTY_HEADER; self.max_headers];
            let mut res = httparse::Response::new(&mut parsed_headers);

            let body_offset = match res.parse(src).map_err(|e| map_httparse_error(e, self.max_headers))? {
                Status::Complete(body_offset) => body_offset,
                Status::Partial => {
                    ensure!(
                        src.len() <= self.max_header_bytes,
                        ParseError::too_large_header(src.len(), self.max_header_bytes)
                    );
                    return Ok(None);
                }
            };
            ensure!(body_offset <= self.max_header_bytes, ParseError::too_large_header(body_offset, self.max_header_bytes));

            let keep_alive_default = match res.version {
                Some(0) => false,
                Some(1) => true,
                v => return Err(ParseError::InvalidVersion(v)),
            };
            let status = StatusCode::from_u16(res.code.ok_or(ParseError::InvalidStatus)?)
                .map_err(|_| ParseError::InvalidStatus)?;
            let indices = HeaderIndex::record(src, res.headers);

            let head = src.split_to(body_offset).freeze();

            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                trace!(status = status.as_u16(), "skipping interim response");
                continue;
            }

            let mut fields = build_fields(&head, &indices)?;
            if !keep_alive_default && !has_connection_token(&fields, "keep-alive") {
                fields.insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
            let payload_size = self.response_payload(status, &fields)?;
            trace!(status = status.as_u16(), payload_size = ?payload_size, "parsed response head");

            let mut headers = Headers::response(status);
            *headers.fields_mut() = fields;
            return Ok(Some((headers, payload_size)));
        }
    }
}

impl ResponseHeaderDecoder {
    /// refer: <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>
    fn response_payload(&self, status: StatusCode, fields: &HeaderMap) -> Result<PayloadSize, ParseError> {
        if self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(PayloadSize::Empty);
        }

        let te_header = fields.get(header::TRANSFER_ENCODING);
        if te_header.is_some() {
            return Ok(if is_chunked(te_header) { PayloadSize::Chunked } else { PayloadSize::UntilClose });
        }

        Ok(match content_length(fields)? {
            Some(length) => PayloadSize::from_length(length),
            None => PayloadSize::UntilClose,
        })
    }
}
