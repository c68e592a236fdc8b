use std::fmt;
use std::io;

use thiserror::Error;

/// Error codes carried by RST_STREAM and GOAWAY (RFC 9113 section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    /// A code this implementation does not know; treated as `InternalError`.
    Unknown(u32),
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Unknown(code) => code,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
            ErrorCode::Unknown(code) => return write!(f, "UNKNOWN({code:#x})"),
        };
        f.write_str(name)
    }
}

/// A connection-level HTTP/2 failure. The session answers it with GOAWAY.
#[derive(Debug, Error)]
pub enum Http2Error {
    #[error("invalid connection preface")]
    InvalidPreface,

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("frame size error: {reason}")]
    FrameSize { reason: String },

    #[error("hpack compression error: {reason}")]
    Compression { reason: &'static str },

    #[error("connection flow control window violated")]
    FlowControl,

    #[error("stream {stream_id} is not usable: {code}")]
    Stream { stream_id: u32, code: ErrorCode },

    #[error("peer is going away: {code}")]
    GoingAway { code: ErrorCode },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl Http2Error {
    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { reason: str.to_string() }
    }

    pub fn frame_size<S: ToString>(str: S) -> Self {
        Self::FrameSize { reason: str.to_string() }
    }

    pub fn compression(reason: &'static str) -> Self {
        Self::Compression { reason }
    }

    /// The code sent in the GOAWAY that answers this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Http2Error::InvalidPreface | Http2Error::Protocol { .. } => ErrorCode::ProtocolError,
            Http2Error::FrameSize { .. } => ErrorCode::FrameSizeError,
            Http2Error::Compression { .. } => ErrorCode::CompressionError,
            Http2Error::FlowControl => ErrorCode::FlowControlError,
            Http2Error::Stream { code, .. } | Http2Error::GoingAway { code } => *code,
            Http2Error::Io { .. } => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_the_wire() {
        for raw in 0..=0xd {
            assert_eq!(ErrorCode::from(raw).as_u32(), raw);
        }
        assert_eq!(ErrorCode::from(0x42), ErrorCode::Unknown(0x42));
        assert_eq!(ErrorCode::FlowControlError.to_string(), "FLOW_CONTROL_ERROR");
    }

    #[test]
    fn errors_map_to_goaway_codes() {
        assert_eq!(Http2Error::InvalidPreface.code(), ErrorCode::ProtocolError);
        assert_eq!(Http2Error::compression("bad index").code(), ErrorCode::CompressionError);
        assert_eq!(Http2Error::FlowControl.code(), ErrorCode::FlowControlError);
    }
}
