//! Chunked transfer coding on the way out,
//! [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112.html#name-chunked-transfer-coding).

use bytes::{Buf, BufMut, BytesMut};
use http::HeaderMap;
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, SendError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkedEncoder {
    finished: bool,
}

impl ChunkedEncoder {
    pub fn is_complete(&self) -> bool {
        self.finished
    }
}

fn put_last_chunk(trailers: Option<&HeaderMap>, dst: &mut BytesMut) {
    dst.put_slice(b"0\r\n");
    for (name, value) in trailers.into_iter().flatten() {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.finished {
            return Err(SendError::invalid_state("chunked body already finished"));
        }

        match item {
            // an empty chunk would read as the last chunk
            PayloadItem::Chunk(data) if !data.has_remaining() => {}
            PayloadItem::Chunk(mut data) => {
                let size = format!("{:X}\r\n", data.remaining());
                dst.reserve(size.len() + data.remaining() + 2);
                dst.put_slice(size.as_bytes());
                dst.put(&mut data);
                dst.put_slice(b"\r\n");
            }
            PayloadItem::Trailers(trailers) => {
                self.finished = true;
                put_last_chunk(Some(&trailers), dst);
            }
            PayloadItem::Eof => {
                self.finished = true;
                put_last_chunk(None, dst);
            }
        }
        Ok(())
    }
}
