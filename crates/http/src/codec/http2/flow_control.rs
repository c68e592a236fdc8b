//! Flow control windows (RFC 9113 section 5.2 and 6.9).

use super::MAX_WINDOW_SIZE;
use super::error::Http2Error;
use crate::ensure;

/// A send window: what the peer allows us to send. May go negative after the peer
/// shrinks SETTINGS_INITIAL_WINDOW_SIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendWindow {
    available: i64,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self { available: i64::from(initial) }
    }

    /// How many bytes may be sent now.
    pub(crate) fn available(&self) -> usize {
        usize::try_from(self.available).unwrap_or(0)
    }

    pub(crate) fn consume(&mut self, len: usize) {
        self.available -= len as i64;
    }

    pub(crate) fn increase(&mut self, increment: u32) -> Result<(), Http2Error> {
        let next = self.available + i64::from(increment);
        ensure!(next <= i64::from(MAX_WINDOW_SIZE), Http2Error::FlowControl);
        self.available = next;
        Ok(())
    }

    /// Shifts the window by the change of the peer's initial window size.
    pub(crate) fn adjust(&mut self, delta: i64) -> Result<(), Http2Error> {
        let next = self.available + delta;
        ensure!(next <= i64::from(MAX_WINDOW_SIZE), Http2Error::FlowControl);
        self.available = next;
        Ok(())
    }
}

/// A receive window: what we allow the peer to send.
///
/// Consumed bytes are handed back with WINDOW_UPDATE once half of the initial window
/// is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvWindow {
    initial: u32,
    available: u32,
    unreleased: u32,
}

impl RecvWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self { initial, available: initial, unreleased: 0 }
    }

    /// Accounts for `len` received bytes; fails if the peer overran the window.
    pub(crate) fn consume(&mut self, len: u32) -> Result<(), Http2Error> {
        ensure!(len <= self.available, Http2Error::FlowControl);
        self.available -= len;
        self.unreleased += len;
        Ok(())
    }

    /// Returns the WINDOW_UPDATE increment to send, if one is due.
    pub(crate) fn release(&mut self) -> Option<u32> {
        if self.unreleased == 0 || self.unreleased < self.initial / 2 {
            return None;
        }
        let increment = self.unreleased;
        self.available += increment;
        self.unreleased = 0;
        Some(increment)
    }
}
