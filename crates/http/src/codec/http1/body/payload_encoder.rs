use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use super::chunked_encoder::ChunkedEncoder;
use super::length_encoder::LengthEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};

/// Frames an outbound body the way its head announced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadEncoder {
    Length(LengthEncoder),
    Chunked(ChunkedEncoder),
    /// Drops every byte, as for a reply to `HEAD` or a `204`.
    Discard,
}

impl PayloadEncoder {
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadEncoder::Chunked(_))
    }

    /// The announced body has been written in full.
    pub fn is_complete(&self) -> bool {
        match self {
            PayloadEncoder::Length(encoder) => encoder.is_complete(),
            PayloadEncoder::Chunked(encoder) => encoder.is_complete(),
            PayloadEncoder::Discard => true,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => PayloadEncoder::Length(LengthEncoder::new(length)),
            PayloadSize::Chunked => PayloadEncoder::Chunked(ChunkedEncoder::default()),
            PayloadSize::UntilClose | PayloadSize::Empty => PayloadEncoder::Discard,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            PayloadEncoder::Length(encoder) => encoder.encode(item, dst),
            PayloadEncoder::Chunked(encoder) => encoder.encode(item, dst),
            PayloadEncoder::Discard => Ok(()),
        }
    }
}
