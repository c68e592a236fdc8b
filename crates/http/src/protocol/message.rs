use bytes::{Buf, Bytes};
use http::HeaderMap;

/// What an HTTP/1.1 message decoder yields: a message head, then the pieces of its body.
#[derive(Debug)]
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

impl<T> Message<T> {
    pub fn head(&self) -> Option<&T> {
        match self {
            Message::Header(head) => Some(head),
            Message::Payload(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&PayloadItem> {
        match self {
            Message::Header(_) => None,
            Message::Payload(item) => Some(item),
        }
    }
}

/// A piece of a message body. A body ends with exactly one `Eof` or `Trailers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    /// Fields after the last chunk of a chunked body
    Trailers(HeaderMap),
    Eof,
}

impl<D: Buf> PayloadItem<D> {
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        if let PayloadItem::Chunk(bytes) = self { Some(bytes) } else { None }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        if let PayloadItem::Chunk(bytes) = self { Some(bytes) } else { None }
    }
}

/// The framing a message head announces for its body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `content-length`
    Length(u64),
    /// `transfer-encoding: chunked`
    Chunked,
    /// A response body delimited by the connection closing
    UntilClose,
    Empty,
}

impl PayloadSize {
    /// `Length(0)` is folded into `Empty`.
    pub fn from_length(length: u64) -> Self {
        match length {
            0 => PayloadSize::Empty,
            n => PayloadSize::Length(n),
        }
    }

    pub fn is_chunked(self) -> bool {
        self == PayloadSize::Chunked
    }

    pub fn is_empty(self) -> bool {
        self == PayloadSize::Empty
    }
}
