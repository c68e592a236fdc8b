//! HTTP/2 framing (RFC 9113 section 4 and 6)
//!
//! Every frame starts with a fixed 9-byte header:
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```
//!
//! [`FrameCodec`] is a [`Decoder`]/[`Encoder`] pair over these frames. It checks the
//! structural rules of each frame type (fixed payload sizes, stream 0 or not, padding)
//! and leaves the connection rules to the session.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::DEFAULT_MAX_FRAME_SIZE;
use super::error::{ErrorCode, Http2Error};
use super::settings::SettingsParams;
use crate::ensure;

pub const FRAME_HEADER_LEN: usize = 9;

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const PRIORITY: u8 = 0x2;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PUSH_PROMISE: u8 = 0x5;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;
const CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Padding bytes stripped on receipt; they still count against flow control.
        padding: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    /// Priority signals are advisory and carry nothing this engine uses.
    Priority { stream_id: u32 },
    RstStream { stream_id: u32, code: ErrorCode },
    Settings { ack: bool, params: SettingsParams },
    PushPromise { stream_id: u32, promised_stream_id: u32 },
    Ping { ack: bool, payload: [u8; 8] },
    GoAway { last_stream_id: u32, code: ErrorCode, debug_data: Bytes },
    WindowUpdate { stream_id: u32, increment: u32 },
    Continuation { stream_id: u32, block: Bytes, end_headers: bool },
    /// Frames of an unknown type are ignored.
    Unknown { kind: u8, stream_id: u32 },
}

impl Frame {
    pub fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        Frame::Data { stream_id, data, end_stream, padding: 0 }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHead {
    length: u32,
    kind: u8,
    flags: u8,
    stream_id: u32,
}

impl FrameHead {
    fn parse(mut src: &[u8]) -> Self {
        let length = src.get_uint(3) as u32;
        let kind = src.get_u8();
        let flags = src.get_u8();
        let stream_id = src.get_u32() & STREAM_ID_MASK;
        Self { length, kind, flags, stream_id }
    }

    fn write(self, dst: &mut BytesMut) {
        dst.put_uint(u64::from(self.length), 3);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & STREAM_ID_MASK);
    }

    fn has(self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Decodes and encodes whole frames.
///
/// `max_frame_size` bounds the payload of received frames; outbound frames are sized by
/// the caller.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self { max_frame_size: DEFAULT_MAX_FRAME_SIZE }
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Http2Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let head = FrameHead::parse(&src[..FRAME_HEADER_LEN]);
        ensure!(
            head.length <= self.max_frame_size,
            Http2Error::frame_size(format!("frame of {} bytes exceeds {}", head.length, self.max_frame_size))
        );

        let total = FRAME_HEADER_LEN + head.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(total).freeze();
        payload.advance(FRAME_HEADER_LEN);
        parse_payload(head, payload).map(Some)
    }
}

fn parse_payload(head: FrameHead, mut payload: Bytes) -> Result<Frame, Http2Error> {
    let stream_id = head.stream_id;
    let on_stream = |name: &str| -> Result<(), Http2Error> {
        ensure!(stream_id != 0, Http2Error::protocol(format!("{name} on stream 0")));
        Ok(())
    };
    let on_connection = |name: &str| -> Result<(), Http2Error> {
        ensure!(stream_id == 0, Http2Error::protocol(format!("{name} on stream {stream_id}")));
        Ok(())
    };

    let frame = match head.kind {
        DATA => {
            on_stream("DATA")?;
            let padding = strip_padding(head, &mut payload)?;
            Frame::Data { stream_id, data: payload, end_stream: head.has(FLAG_END_STREAM), padding }
        }
        HEADERS => {
            on_stream("HEADERS")?;
            strip_padding(head, &mut payload)?;
            if head.has(FLAG_PRIORITY) {
                ensure!(payload.len() >= 5, Http2Error::frame_size("HEADERS priority block is truncated"));
                payload.advance(5);
            }
            Frame::Headers {
                stream_id,
                block: payload,
                end_stream: head.has(FLAG_END_STREAM),
                end_headers: head.has(FLAG_END_HEADERS),
            }
        }
        PRIORITY => {
            on_stream("PRIORITY")?;
            ensure!(payload.len() == 5, Http2Error::frame_size("PRIORITY payload must be 5 bytes"));
            Frame::Priority { stream_id }
        }
        RST_STREAM => {
            on_stream("RST_STREAM")?;
            ensure!(payload.len() == 4, Http2Error::frame_size("RST_STREAM payload must be 4 bytes"));
            Frame::RstStream { stream_id, code: payload.get_u32().into() }
        }
        SETTINGS => {
            on_connection("SETTINGS")?;
            if head.has(FLAG_ACK) {
                ensure!(payload.is_empty(), Http2Error::frame_size("SETTINGS ack with a payload"));
                Frame::Settings { ack: true, params: SettingsParams::default() }
            } else {
                Frame::Settings { ack: false, params: SettingsParams::decode(&payload)? }
            }
        }
        PUSH_PROMISE => {
            on_stream("PUSH_PROMISE")?;
            strip_padding(head, &mut payload)?;
            ensure!(payload.len() >= 4, Http2Error::frame_size("PUSH_PROMISE is truncated"));
            Frame::PushPromise { stream_id, promised_stream_id: payload.get_u32() & STREAM_ID_MASK }
        }
        PING => {
            on_connection("PING")?;
            ensure!(payload.len() == 8, Http2Error::frame_size("PING payload must be 8 bytes"));
            let mut data = [0u8; 8];
            payload.copy_to_slice(&mut data);
            Frame::Ping { ack: head.has(FLAG_ACK), payload: data }
        }
        GOAWAY => {
            on_connection("GOAWAY")?;
            ensure!(payload.len() >= 8, Http2Error::frame_size("GOAWAY is truncated"));
            let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
            let code = payload.get_u32().into();
            Frame::GoAway { last_stream_id, code, debug_data: payload }
        }
        WINDOW_UPDATE => {
            ensure!(payload.len() == 4, Http2Error::frame_size("WINDOW_UPDATE payload must be 4 bytes"));
            let increment = payload.get_u32() & STREAM_ID_MASK;
            Frame::WindowUpdate { stream_id, increment }
        }
        CONTINUATION => {
            on_stream("CONTINUATION")?;
            Frame::Continuation { stream_id, block: payload, end_headers: head.has(FLAG_END_HEADERS) }
        }
        kind => Frame::Unknown { kind, stream_id },
    };
    Ok(frame)
}

/// Strips the pad length octet and trailing padding, returning how many bytes went.
fn strip_padding(head: FrameHead, payload: &mut Bytes) -> Result<u32, Http2Error> {
    if !head.has(FLAG_PADDED) {
        return Ok(0);
    }
    ensure!(!payload.is_empty(), Http2Error::frame_size("padded frame without a pad length"));
    let pad_len = payload.get_u8() as usize;
    ensure!(pad_len <= payload.len(), Http2Error::protocol("padding exceeds the frame payload"));
    payload.truncate(payload.len() - pad_len);
    Ok(pad_len as u32 + 1)
}

impl Encoder<Frame> for FrameCodec {
    type Error = Http2Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let stream_id = frame.stream_id();
        let head = |kind: u8, flags: u8, length: usize| FrameHead { length: length as u32, kind, flags, stream_id };
        let flag = |set: bool, flag: u8| if set { flag } else { 0 };

        match frame {
            Frame::Data { data, end_stream, .. } => {
                dst.reserve(FRAME_HEADER_LEN + data.len());
                head(DATA, flag(end_stream, FLAG_END_STREAM), data.len()).write(dst);
                dst.put_slice(&data);
            }
            Frame::Headers { block, end_stream, end_headers, .. } => {
                let flags = flag(end_stream, FLAG_END_STREAM) | flag(end_headers, FLAG_END_HEADERS);
                dst.reserve(FRAME_HEADER_LEN + block.len());
                head(HEADERS, flags, block.len()).write(dst);
                dst.put_slice(&block);
            }
            Frame::Continuation { block, end_headers, .. } => {
                dst.reserve(FRAME_HEADER_LEN + block.len());
                head(CONTINUATION, flag(end_headers, FLAG_END_HEADERS), block.len()).write(dst);
                dst.put_slice(&block);
            }
            Frame::RstStream { code, .. } => {
                head(RST_STREAM, 0, 4).write(dst);
                dst.put_u32(code.as_u32());
            }
            Frame::Settings { ack, params } => {
                if ack {
                    head(SETTINGS, FLAG_ACK, 0).write(dst);
                } else {
                    head(SETTINGS, 0, params.encoded_len()).write(dst);
                    params.encode(dst);
                }
            }
            Frame::Ping { ack, payload } => {
                head(PING, flag(ack, FLAG_ACK), 8).write(dst);
                dst.put_slice(&payload);
            }
            Frame::GoAway { last_stream_id, code, debug_data } => {
                head(GOAWAY, 0, 8 + debug_data.len()).write(dst);
                dst.put_u32(last_stream_id & STREAM_ID_MASK);
                dst.put_u32(code.as_u32());
                dst.put_slice(&debug_data);
            }
            Frame::WindowUpdate { increment, .. } => {
                head(WINDOW_UPDATE, 0, 4).write(dst);
                dst.put_u32(increment & STREAM_ID_MASK);
            }
            Frame::Priority { .. } | Frame::PushPromise { .. } | Frame::Unknown { .. } => {
                return Err(Http2Error::protocol("frame type is never sent"));
            }
        }
        Ok(())
    }
}
