//! Byte queues used by connections and codecs
//!
//! [`Buffer`] is the unit of exchange between a connection and its filters: filters get
//! a `&mut Buffer` for the length of one callback and may drain, inspect or append to it.
//! [`WatermarkBuffer`] adds size-change tracking so a connection can report growth and
//! shrinkage of its read and write queues to its observers.

mod watermark;

pub use watermark::BufferChange;
pub use watermark::WatermarkBuffer;
pub use watermark::Watermarks;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A growable byte queue. Bytes are appended at the back and drained from the front.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: BytesMut::with_capacity(capacity) }
    }

    /// Appends a copy of `data`.
    pub fn add(&mut self, data: impl AsRef<[u8]>) {
        self.inner.put_slice(data.as_ref());
    }

    /// Removes `size` bytes from the front. Draining more than `len()` empties the buffer.
    pub fn drain(&mut self, size: usize) {
        let size = size.min(self.inner.len());
        self.inner.advance(size);
    }

    /// Moves every byte of `other` to the back of this buffer, leaving `other` empty.
    pub fn move_from(&mut self, other: &mut Buffer) {
        if self.inner.is_empty() {
            std::mem::swap(&mut self.inner, &mut other.inner);
            return;
        }
        let bytes = other.inner.split();
        self.inner.unsplit(bytes);
    }

    /// Moves at most `size` bytes from the front of `other` to the back of this buffer.
    pub fn move_len(&mut self, other: &mut Buffer, size: usize) {
        let size = size.min(other.len());
        let bytes = other.inner.split_to(size);
        self.inner.unsplit(bytes);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Splits off the first `size` bytes as an immutable chunk.
    pub fn split_to(&mut self, size: usize) -> Bytes {
        let size = size.min(self.inner.len());
        self.inner.split_to(size).freeze()
    }

    /// Takes every byte out of the buffer.
    pub fn take_bytes(&mut self) -> Bytes {
        self.inner.split().freeze()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Returns the position of the first occurrence of `needle`.
    pub fn search(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.inner.windows(needle.len()).position(|window| window == needle)
    }

    /// The underlying storage, for codecs built on `tokio_util::codec`.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.inner
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self {
        Self { inner: BytesMut::from(data) }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self { inner: BytesMut::from(data) }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { inner: BytesMut::from(&data[..]) }
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self { inner: BytesMut::from(data) }
    }
}

impl From<BytesMut> for Buffer {
    fn from(inner: BytesMut) -> Self {
        Self { inner }
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.inner))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.inner.len()).finish()
    }
}
