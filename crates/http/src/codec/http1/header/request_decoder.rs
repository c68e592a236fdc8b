use bytes::BytesMut;
use http::{HeaderValue, Method, header};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use super::{HeaderIndex, build_fields, content_length, has_connection_token, is_chunked, map_httparse_error};
use crate::codec::Http1Settings;
use crate::ensure;
use crate::protocol::{Headers, ParseError, PayloadSize};

/// Decodes a request head and picks the framing of the request body.
///
/// The `host` field becomes the authority. An HTTP/1.0 request without
/// `connection: keep-alive` gets `connection: close` so the server closes after replying.
#[derive(Debug, Clone)]
pub struct RequestHeaderDecoder {
    max_header_bytes: usize,
    max_headers: usize,
}

impl RequestHeaderDecoder {
    pub fn new(settings: Http1Settings) -> Self {
        Self { max_header_bytes: settings.max_header_bytes(), max_headers: settings.max_headers() }
    }
}

impl Default for RequestHeaderDecoder {
    fn default() -> Self {
        Self::new(Http1Settings::default())
    }
}

impl Decoder for RequestHeaderDecoder {
    type Item = (Headers, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut parsed_headers = vec![httparse::EMPTY_HEADER; self.max_headers];
        let mut req = httparse::Request::new(&mut parsed_headers);

        let body_offset = match req.parse(src).map_err(|e| map_httparse_error(e, self.max_headers))? {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
                return Ok(None);
            }
        };
        trace!(header_size = body_offset, "parsed request head");
        ensure!(body_offset <= self.max_header_bytes, ParseError::too_large_header(body_offset, self.max_header_bytes));

        let keep_alive_default = match req.version {
            Some(0) => false,
            Some(1) => true,
            v => return Err(ParseError::InvalidVersion(v)),
        };
        let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes())
            .map_err(|_| ParseError::InvalidMethod)?;
        let path = req.path.ok_or(ParseError::InvalidUri)?.to_owned();
        let indices = HeaderIndex::record(src, req.headers);

        let head = src.split_to(body_offset).freeze();
        let mut fields = build_fields(&head, &indices)?;

        let authority = match fields.remove(header::HOST) {
            Some(host) => host.to_str().map_err(ParseError::invalid_header)?.to_owned(),
            None => String::new(),
        };

        let mut headers = Headers::request(method, path, authority);
        if !keep_alive_default && !has_connection_token(&fields, "keep-alive") {
            fields.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        let payload_size = request_payload(&fields)?;
        *headers.fields_mut() = fields;

        Ok(Some((headers, payload_size)))
    }
}

/// refer: <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>
fn request_payload(fields: &http::HeaderMap) -> Result<PayloadSize, ParseError> {
    let te_header = fields.get(header::TRANSFER_ENCODING);
    match (te_header, content_length(fields)?) {
        (None, None) => Ok(PayloadSize::Empty),
        (Some(_), None) if is_chunked(te_header) => Ok(PayloadSize::Chunked),
        (Some(_), None) => Err(ParseError::invalid_header("request transfer-encoding must end with chunked")),
        (None, Some(length)) => Ok(PayloadSize::from_length(length)),
        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers"))
        }
    }
}
