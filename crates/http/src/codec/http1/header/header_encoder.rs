use std::io;
use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, StatusCode, header};
use tokio_util::codec::Encoder;

use crate::protocol::{Headers, PayloadSize, SendError};

const INIT_HEADER_SIZE: usize = 1024;

/// Writes a request or response head followed by the framing header for `PayloadSize`.
///
/// A head with a method is a request; one with a status is a response. The authority of
/// a request is written as `host`. A response announced as `Empty` that may carry a body
/// gets `content-length: 0`.
#[derive(Debug, Default)]
pub struct HeaderEncoder;

impl Encoder<(&Headers, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (&Headers, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (headers, payload_size) = item;
        dst.reserve(INIT_HEADER_SIZE);

        let status = match (headers.method(), headers.status()) {
            (Some(method), _) => {
                let path = headers.path().filter(|p| !p.is_empty()).unwrap_or("/");
                write!(FastWrite(dst), "{} {} HTTP/1.1\r\n", method.as_str(), path)?;
                if let Some(authority) = headers.authority().filter(|a| !a.is_empty()) {
                    write_field(dst, header::HOST.as_str().as_bytes(), authority.as_bytes());
                }
                None
            }
            (None, Some(status)) => {
                write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;
                Some(status)
            }
            (None, None) => return Err(SendError::invalid_header("head has neither :method nor :status")),
        };

        let skip_host = headers.authority().is_some_and(|a| !a.is_empty());
        for (name, value) in headers.fields() {
            let framing = *name == header::CONTENT_LENGTH || *name == header::TRANSFER_ENCODING;
            if (skip_host && *name == header::HOST) || (framing && !payload_size.is_empty()) {
                continue;
            }
            write_field(dst, name.as_str().as_bytes(), value.as_bytes());
        }

        match payload_size {
            PayloadSize::Length(n) => {
                write_field(dst, header::CONTENT_LENGTH.as_str().as_bytes(), HeaderValue::from(n).as_bytes());
            }
            PayloadSize::Chunked => {
                write_field(dst, header::TRANSFER_ENCODING.as_str().as_bytes(), b"chunked");
            }
            PayloadSize::Empty => {
                if status.is_some_and(may_have_body) && !headers.fields().contains_key(header::CONTENT_LENGTH) {
                    write_field(dst, header::CONTENT_LENGTH.as_str().as_bytes(), b"0");
                }
            }
            PayloadSize::UntilClose => {}
        }

        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn may_have_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

fn write_field(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.put_slice(name);
    dst.put_slice(b": ");
    dst.put_slice(value);
    dst.put_slice(b"\r\n");
}

struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use indoc::indoc;

    fn encode(headers: &Headers, payload_size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((headers, payload_size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn request_with_length() {
        let headers = Headers::request(Method::POST, "/echo", "localhost")
            .with_header(header::ACCEPT, HeaderValue::from_static("*/*"))
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("5"));

        let expected = indoc! {"
            POST /echo HTTP/1.1\r
            host: localhost\r
            accept: */*\r
            content-length: 5\r
            \r
        "};
        assert_eq!(encode(&headers, PayloadSize::Length(5)), expected);
    }

    #[test]
    fn request_without_body_has_no_framing() {
        let headers = Headers::request(Method::GET, "/status", "localhost");
        assert_eq!(encode(&headers, PayloadSize::Empty), "GET /status HTTP/1.1\r\nhost: localhost\r\n\r\n");
    }

    #[test]
    fn chunked_response_drops_stale_length() {
        let headers = Headers::response(StatusCode::OK)
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert_eq!(encode(&headers, PayloadSize::Chunked), "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
    }

    #[test]
    fn empty_response_gets_zero_length() {
        let headers = Headers::response(StatusCode::OK);
        assert_eq!(encode(&headers, PayloadSize::Empty), "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");

        let headers = Headers::response(StatusCode::NO_CONTENT);
        assert_eq!(encode(&headers, PayloadSize::Empty), "HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn head_needs_method_or_status() {
        let mut dst = BytesMut::new();
        let result = HeaderEncoder.encode((&Headers::new(), PayloadSize::Empty), &mut dst);
        assert!(matches!(result, Err(SendError::InvalidHeader { .. })));
    }
}
