use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::chunked_decoder::ChunkedDecoder;
use super::length_decoder::LengthDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};

/// Decodes a message body framed in any of the HTTP/1.1 ways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadDecoder {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
    /// Everything until the transport closes; the owner ends it, it never yields `Eof`.
    UntilClose,
    Empty,
}

impl PayloadDecoder {
    pub fn is_until_close(&self) -> bool {
        matches!(self, PayloadDecoder::UntilClose)
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => PayloadDecoder::Length(LengthDecoder::new(length)),
            PayloadSize::Chunked => PayloadDecoder::Chunked(ChunkedDecoder::new()),
            PayloadSize::UntilClose => PayloadDecoder::UntilClose,
            PayloadSize::Empty => PayloadDecoder::Empty,
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            PayloadDecoder::Length(decoder) => decoder.decode(src),
            PayloadDecoder::Chunked(decoder) => decoder.decode(src),
            PayloadDecoder::UntilClose if src.is_empty() => Ok(None),
            PayloadDecoder::UntilClose => Ok(Some(PayloadItem::Chunk(src.split().freeze()))),
            PayloadDecoder::Empty => Ok(Some(PayloadItem::Eof)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_close_takes_everything() {
        let mut decoder = PayloadDecoder::from(PayloadSize::UntilClose);
        assert!(decoder.is_until_close());

        let mut buf = BytesMut::from(&b"all of it"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_bytes().unwrap().as_ref(), b"all of it");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn empty_body_ends_at_once() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Empty);
        let mut buf = BytesMut::from(&b"next message"[..]);
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_eof());
        assert_eq!(buf.len(), 12);
    }
}
