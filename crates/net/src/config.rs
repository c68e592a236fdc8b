//! Per-connection tuning knobs.

use crate::buffer::Watermarks;

/// Initial reservation made in the read buffer before each socket read
const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// Settings applied to every connection a dispatcher or listener creates.
///
/// ```
/// use micro_proxy_net::ConnectionConfig;
/// use micro_proxy_net::buffer::Watermarks;
///
/// let config = ConnectionConfig::default()
///     .with_no_delay(true)
///     .with_write_watermarks(Watermarks::new(16 * 1024, 64 * 1024));
/// assert!(config.no_delay());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    read_watermarks: Watermarks,
    write_watermarks: Watermarks,
    no_delay: bool,
    read_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_watermarks: Watermarks::default(),
            write_watermarks: Watermarks::default(),
            no_delay: false,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn with_read_watermarks(mut self, watermarks: Watermarks) -> Self {
        self.read_watermarks = watermarks;
        self
    }

    #[must_use]
    pub fn with_write_watermarks(mut self, watermarks: Watermarks) -> Self {
        self.write_watermarks = watermarks;
        self
    }

    #[must_use]
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    #[must_use]
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size.max(1);
        self
    }

    pub fn read_watermarks(&self) -> Watermarks {
        self.read_watermarks
    }

    pub fn write_watermarks(&self) -> Watermarks {
        self.write_watermarks
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }
}
