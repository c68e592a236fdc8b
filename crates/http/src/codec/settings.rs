/// Limits of the HTTP/1.1 codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1Settings {
    max_header_bytes: usize,
    max_headers: usize,
}

impl Default for Http1Settings {
    fn default() -> Self {
        Self { max_header_bytes: 8 * 1024, max_headers: 64 }
    }
}

impl Http1Settings {
    #[must_use]
    pub fn with_max_header_bytes(mut self, max_header_bytes: usize) -> Self {
        self.max_header_bytes = max_header_bytes;
        self
    }

    #[must_use]
    pub fn with_max_headers(mut self, max_headers: usize) -> Self {
        self.max_headers = max_headers;
        self
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    pub fn max_headers(&self) -> usize {
        self.max_headers
    }
}

/// The local SETTINGS advertised by the HTTP/2 codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    header_table_size: u32,
    initial_window_size: u32,
    max_frame_size: u32,
    max_concurrent_streams: u32,
    max_header_list_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_concurrent_streams: 100,
            max_header_list_size: 64 * 1024,
        }
    }
}

impl Http2Settings {
    #[must_use]
    pub fn with_header_table_size(mut self, size: u32) -> Self {
        self.header_table_size = size;
        self
    }

    /// Clamped to the protocol maximum of `2^31 - 1`.
    #[must_use]
    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size.min(super::http2::MAX_WINDOW_SIZE);
        self
    }

    /// Clamped to the protocol range `16_384..=16_777_215`.
    #[must_use]
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size.clamp(super::http2::DEFAULT_MAX_FRAME_SIZE, super::http2::MAX_MAX_FRAME_SIZE);
        self
    }

    #[must_use]
    pub fn with_max_concurrent_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_streams = streams;
        self
    }

    #[must_use]
    pub fn with_max_header_list_size(mut self, size: u32) -> Self {
        self.max_header_list_size = size;
        self
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size
    }

    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn max_concurrent_streams(&self) -> u32 {
        self.max_concurrent_streams
    }

    /// Server push is never offered or accepted.
    pub fn enable_push(&self) -> bool {
        false
    }

    pub fn max_header_list_size(&self) -> u32 {
        self.max_header_list_size
    }
}

/// Settings for every codec a [`CodecClient`](crate::codec_client::CodecClient) or
/// [`ServerCodecFilter`](crate::server::ServerCodecFilter) may build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecSettings {
    http1: Http1Settings,
    http2: Http2Settings,
}

impl CodecSettings {
    #[must_use]
    pub fn with_http1(mut self, http1: Http1Settings) -> Self {
        self.http1 = http1;
        self
    }

    #[must_use]
    pub fn with_http2(mut self, http2: Http2Settings) -> Self {
        self.http2 = http2;
        self
    }

    pub fn http1(&self) -> Http1Settings {
        self.http1
    }

    pub fn http2(&self) -> Http2Settings {
        self.http2
    }
}
