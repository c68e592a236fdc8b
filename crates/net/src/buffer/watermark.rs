//! Size-change tracking for connection buffers.

use super::Buffer;
use crate::network::ConnectionBufferType;

/// Low and high thresholds for a [`WatermarkBuffer`].
///
/// The default (both zero) reports every size change.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    low: usize,
    high: usize,
}

impl Watermarks {
    /// Creates thresholds; `low` is clamped to `high`.
    pub fn new(low: usize, high: usize) -> Self {
        Self { low: low.min(high), high }
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }

    fn is_disabled(&self) -> bool {
        self.high == 0
    }
}

/// An aggregated size change of a buffer since its previous report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferChange {
    pub kind: ConnectionBufferType,
    pub old_size: u64,
    pub delta: i64,
}

/// A [`Buffer`] that remembers the size it last reported.
///
/// Mutations go through [`buffer_mut`](Self::buffer_mut); the owner then calls
/// [`take_change`](Self::take_change) to learn whether observers should hear about it.
/// Skipped changes are folded into the next report, so reported deltas always add up to
/// the real size movement and are produced in the order the movement happened.
#[derive(Debug)]
pub struct WatermarkBuffer {
    buffer: Buffer,
    kind: ConnectionBufferType,
    watermarks: Watermarks,
    reported_len: usize,
    above_high: bool,
}

impl WatermarkBuffer {
    pub fn new(kind: ConnectionBufferType, watermarks: Watermarks) -> Self {
        Self { buffer: Buffer::new(), kind, watermarks, reported_len: 0, above_high: false }
    }

    pub fn kind(&self) -> ConnectionBufferType {
        self.kind
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Swaps the content out, leaving an empty buffer behind. Pair with [`restore`](Self::restore).
    pub fn take(&mut self) -> Buffer {
        std::mem::take(&mut self.buffer)
    }

    /// Puts back content previously taken with [`take`](Self::take).
    ///
    /// Bytes added while the content was out are kept behind the restored ones.
    pub fn restore(&mut self, mut buffer: Buffer) {
        buffer.move_from(&mut self.buffer);
        self.buffer = buffer;
    }

    /// Returns the pending change if the current size should be reported.
    pub fn take_change(&mut self) -> Option<BufferChange> {
        let len = self.buffer.len();
        if len == self.reported_len {
            return None;
        }

        let report = if self.watermarks.is_disabled() {
            true
        } else if !self.above_high && len >= self.watermarks.high {
            self.above_high = true;
            true
        } else if self.above_high && len <= self.watermarks.low {
            self.above_high = false;
            true
        } else {
            false
        };

        if !report {
            return None;
        }

        let change = BufferChange {
            kind: self.kind,
            old_size: self.reported_len as u64,
            delta: len as i64 - self.reported_len as i64,
        };
        self.reported_len = len;
        Some(change)
    }

    /// Drops all content without producing a report.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.reported_len = 0;
        self.above_high = false;
    }
}
