use std::io;

use thiserror::Error;

use crate::codec::http2::Http2Error;

/// The result of a codec dispatch or encode.
///
/// A dispatch error means the byte stream can no longer be trusted: the owner of the
/// codec aborts the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("parse error: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("send error: {source}")]
    Send {
        #[from]
        source: SendError,
    },

    #[error("http/2 error: {source}")]
    Http2 {
        #[from]
        source: Http2Error,
    },

    #[error("stream fault: {source}")]
    Stream {
        #[from]
        source: StreamFault,
    },

    #[error("{feature} is not supported")]
    Unsupported { feature: &'static str },

    #[error("connection is closed")]
    ConnectionClosed,
}

impl CodecError {
    pub fn unsupported(feature: &'static str) -> Self {
        Self::Unsupported { feature }
    }
}

/// A decoder refusing a call it can not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamFault {
    /// A decode call arrived after the stream already saw `end_stream`.
    #[error("decode called after the stream completed")]
    DecodeAfterComplete,

    #[error("{feature} is not supported")]
    Unsupported { feature: &'static str },
}

/// A malformed HTTP/1.1 message, or an HTTP/2 header block that breaks the message rules.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header section of {current_size} bytes exceeds the limit of {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} header fields")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("unsupported http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid method")]
    InvalidMethod,

    #[error("invalid request target")]
    InvalidUri,

    #[error("invalid status code")]
    InvalidStatus,

    #[error("invalid content-length: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body framing: {reason}")]
    InvalidBody { reason: String },

    #[error("unexpected message: {reason}")]
    UnexpectedMessage { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header(reason: impl ToString) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_body(reason: impl ToString) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_content_length(reason: impl ToString) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn unexpected_message(reason: impl ToString) -> Self {
        Self::UnexpectedMessage { reason: reason.to_string() }
    }

    pub fn io(e: impl Into<io::Error>) -> Self {
        Self::Io { source: e.into() }
    }
}

/// An outbound message the encoder refuses to frame.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("invalid stream state: {reason}")]
    InvalidState { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_header(reason: impl ToString) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_body(reason: impl ToString) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_state(reason: impl ToString) -> Self {
        Self::InvalidState { reason: reason.to_string() }
    }

    pub fn io(e: impl Into<io::Error>) -> Self {
        Self::Io { source: e.into() }
    }
}
