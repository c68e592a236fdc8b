//! Conversion between [`Headers`] and HPACK field lists.

use std::str;

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use super::hpack::HeaderField;
use super::session::Role;
use crate::ensure;
use crate::protocol::{Headers, ParseError, SendError};

/// Fields that only mean something to one HTTP/1.1 hop.
fn is_connection_specific(name: &HeaderName, value: &HeaderValue) -> bool {
    matches!(name.as_str(), "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade")
        || (name == header::TE && value != "trailers")
}

fn regular_field(name: &HeaderName, value: &HeaderValue) -> HeaderField {
    HeaderField::new(Bytes::copy_from_slice(name.as_str().as_bytes()), Bytes::copy_from_slice(value.as_bytes()))
        .sensitive(value.is_sensitive())
}

/// The field list of a message head, pseudo fields first.
pub(crate) fn head_fields(headers: &Headers) -> Result<Vec<HeaderField>, SendError> {
    let mut fields = Vec::with_capacity(headers.fields().len() + 4);

    let authority = if let Some(method) = headers.method() {
        let authority = headers
            .authority()
            .map(str::to_owned)
            .or_else(|| headers.get(header::HOST).and_then(|v| v.to_str().ok()).map(str::to_owned));

        fields.push(HeaderField::new(":method", Bytes::copy_from_slice(method.as_str().as_bytes())));
        if method != Method::CONNECT {
            let scheme = headers.scheme().unwrap_or("http");
            fields.push(HeaderField::new(":scheme", Bytes::copy_from_slice(scheme.as_bytes())));
        }
        if let Some(authority) = &authority {
            fields.push(HeaderField::new(":authority", Bytes::copy_from_slice(authority.as_bytes())));
        }
        if method != Method::CONNECT {
            let path = headers.path().unwrap_or("/");
            fields.push(HeaderField::new(":path", Bytes::copy_from_slice(path.as_bytes())));
        }
        authority
    } else if let Some(status) = headers.status() {
        fields.push(HeaderField::new(":status", Bytes::copy_from_slice(status.as_str().as_bytes())));
        None
    } else {
        return Err(SendError::invalid_header("a head needs a method or a status"));
    };

    for (name, value) in headers.fields() {
        if is_connection_specific(name, value) || (name == header::HOST && authority.is_some()) {
            continue;
        }
        fields.push(regular_field(name, value));
    }
    Ok(fields)
}

pub(crate) fn trailer_fields(trailers: &HeaderMap) -> Vec<HeaderField> {
    trailers
        .iter()
        .filter(|(name, value)| !is_connection_specific(name, value))
        .map(|(name, value)| regular_field(name, value))
        .collect()
}

fn field_name(field: &HeaderField) -> Result<HeaderName, ParseError> {
    ensure!(
        !field.name.iter().any(u8::is_ascii_uppercase),
        ParseError::invalid_header("uppercase field name")
    );
    HeaderName::from_bytes(&field.name).map_err(ParseError::invalid_header)
}

fn field_value(field: &HeaderField) -> Result<HeaderValue, ParseError> {
    let mut value = HeaderValue::from_maybe_shared(field.value.clone()).map_err(ParseError::invalid_header)?;
    value.set_sensitive(field.sensitive);
    Ok(value)
}

fn pseudo_str(field: &HeaderField) -> Result<&str, ParseError> {
    str::from_utf8(&field.value).map_err(ParseError::invalid_header)
}

/// Builds the head received by a session in `role`: a request on the server, a response
/// on the client. A malformed head is a stream error.
pub(crate) fn decode_head(fields: Vec<HeaderField>, role: Role) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    let mut regular_seen = false;

    for field in fields {
        if field.name.first() == Some(&b':') {
            ensure!(!regular_seen, ParseError::invalid_header("pseudo field after a regular field"));
            match (role, &field.name[..]) {
                (Role::Server, b":method") if headers.method().is_none() => {
                    let method = Method::from_bytes(&field.value).map_err(|_| ParseError::InvalidMethod)?;
                    headers.set_method(method);
                }
                (Role::Server, b":path") if headers.path().is_none() => {
                    ensure!(!field.value.is_empty(), ParseError::InvalidUri);
                    headers.set_path(pseudo_str(&field)?);
                }
                (Role::Server, b":authority") if headers.authority().is_none() => {
                    headers.set_authority(pseudo_str(&field)?);
                }
                (Role::Server, b":scheme") if headers.scheme().is_none() => {
                    headers.set_scheme(pseudo_str(&field)?);
                }
                (Role::Client, b":status") if headers.status().is_none() => {
                    let status = StatusCode::from_bytes(&field.value).map_err(|_| ParseError::InvalidStatus)?;
                    headers.set_status(status);
                }
                _ => return Err(ParseError::invalid_header("unexpected or repeated pseudo field")),
            }
            continue;
        }

        regular_seen = true;
        let name = field_name(&field)?;
        let value = field_value(&field)?;
        ensure!(!is_connection_specific(&name, &value), ParseError::invalid_header("connection-specific field"));
        if name == header::HOST && headers.authority().is_none() && role == Role::Server {
            headers.set_authority(value.to_str().map_err(ParseError::invalid_header)?);
        }
        headers.append(name, value);
    }

    match role {
        Role::Server => {
            let connect = headers.method() == Some(&Method::CONNECT);
            ensure!(headers.method().is_some(), ParseError::InvalidMethod);
            ensure!(connect || headers.path().is_some(), ParseError::InvalidUri);
        }
        Role::Client => ensure!(headers.status().is_some(), ParseError::InvalidStatus),
    }
    Ok(headers)
}

pub(crate) fn decode_trailers(fields: Vec<HeaderField>) -> Result<HeaderMap, ParseError> {
    let mut trailers = HeaderMap::with_capacity(fields.len());
    for field in fields {
        ensure!(field.name.first() != Some(&b':'), ParseError::invalid_header("pseudo field in trailers"));
        let name = field_name(&field)?;
        let value = field_value(&field)?;
        ensure!(!is_connection_specific(&name, &value), ParseError::invalid_header("connection-specific field"));
        trailers.append(name, value);
    }
    Ok(trailers)
}
