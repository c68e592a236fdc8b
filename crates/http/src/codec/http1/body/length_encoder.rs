use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, SendError};

/// Writes a body of an announced length; writing past it or ending early is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(mut data) => {
                let len = data.remaining() as u64;
                if len > self.remaining {
                    return Err(SendError::invalid_body(format!(
                        "{len} bytes exceed the remaining content-length {}",
                        self.remaining
                    )));
                }
                dst.reserve(data.remaining());
                while data.has_remaining() {
                    let chunk = data.chunk();
                    let n = chunk.len();
                    dst.extend_from_slice(chunk);
                    data.advance(n);
                }
                self.remaining -= len;
                Ok(())
            }
            PayloadItem::Eof if self.is_complete() => Ok(()),
            PayloadItem::Eof => {
                Err(SendError::invalid_body(format!("body ended {} bytes short of its content-length", self.remaining)))
            }
            PayloadItem::Trailers(_) => Err(SendError::invalid_body("trailers need chunked transfer coding")),
        }
    }
}
