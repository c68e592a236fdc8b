//! Inputs shared by the codec benchmarks.

/// A captured HTTP/1.1 request used as benchmark input.
#[derive(Debug, Copy, Clone)]
pub struct RequestSample {
    name: &'static str,
    content: &'static str,
}

impl RequestSample {
    pub const fn new(name: &'static str, content: &'static str) -> Self {
        Self { name, content }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn content(&self) -> &'static str {
        self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// The header fields of the request head with lowercase names, in wire order.
    pub fn header_fields(&self) -> Vec<(String, String)> {
        self.content
            .split("\r\n")
            .skip(1)
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
            .collect()
    }
}

pub static GET_SMALL: RequestSample =
    RequestSample::new("get_small", include_str!("../resources/request/get_small.txt"));
pub static GET_LARGE: RequestSample =
    RequestSample::new("get_large", include_str!("../resources/request/get_large.txt"));
pub static POST_CHUNKED: RequestSample =
    RequestSample::new("post_chunked", include_str!("../resources/request/post_chunked.txt"));

pub fn request_samples() -> [RequestSample; 3] {
    [GET_SMALL, GET_LARGE, POST_CHUNKED]
}
