//! The sans-IO HTTP/2 connection state machine
//!
//! A [`Session`] never touches a socket. Received bytes go in through [`Session::recv`],
//! the bytes to send come out of [`Session::take_pending_send`] and everything the
//! streams need to hear about is queued as an [`Event`].
//!
//! Connection errors are answered with GOAWAY and returned; the owner is expected to
//! close the transport after flushing. Stream errors reset only the stream concerned.

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace, warn};

use super::MAX_STREAM_ID;
use super::error::{ErrorCode, Http2Error};
use super::flow_control::{RecvWindow, SendWindow};
use super::frame::{Frame, FrameCodec};
use super::hpack::{self, HeaderField};
use super::settings::{PeerSettings, SettingsParams};
use crate::codec::Http2Settings;
use crate::ensure;
use crate::protocol::StreamResetReason;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// The connection window before any WINDOW_UPDATE; SETTINGS never changes it.
const DEFAULT_CONNECTION_WINDOW: u32 = 65_535;

/// Upper bound of the table our encoder uses, whatever the peer allows.
const MAX_ENCODER_TABLE_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete header block. The first on a stream is the message head, a later one
    /// carries trailers.
    Headers { stream_id: u32, fields: Vec<HeaderField>, end_stream: bool },
    Data { stream_id: u32, data: Bytes, end_stream: bool },
    Reset { stream_id: u32, reason: StreamResetReason },
    GoAway { last_stream_id: u32, code: ErrorCode },
}

#[derive(Debug)]
enum Outbound {
    Data { data: Bytes, end_stream: bool },
    Trailers(Vec<HeaderField>),
}

#[derive(Debug)]
struct StreamState {
    send_window: SendWindow,
    recv_window: RecvWindow,
    queued: VecDeque<Outbound>,
    /// HEADERS went out or came in; until then a reset stays local.
    on_wire: bool,
    /// `end_stream` was handed to us, though it may still be queued.
    local_end: bool,
    remote_end: bool,
}

impl StreamState {
    fn new(send_window: u32, recv_window: u32) -> Self {
        Self {
            send_window: SendWindow::new(send_window),
            recv_window: RecvWindow::new(recv_window),
            queued: VecDeque::new(),
            on_wire: false,
            local_end: false,
            remote_end: false,
        }
    }

    fn is_done(&self) -> bool {
        self.local_end && self.remote_end && self.queued.is_empty()
    }
}

/// A header block still waiting for its CONTINUATION frames.
#[derive(Debug)]
struct PartialBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

/// One side of an HTTP/2 connection.
#[derive(Debug)]
pub struct Session {
    role: Role,
    local: Http2Settings,
    peer: PeerSettings,

    codec: FrameCodec,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,

    streams: HashMap<u32, StreamState>,
    next_stream_id: u32,
    last_peer_stream_id: u32,

    send_window: SendWindow,
    recv_window: RecvWindow,

    partial_block: Option<PartialBlock>,
    awaiting_preface: bool,
    settings_received: bool,
    going_away: bool,
    peer_going_away: bool,

    send_buf: BytesMut,
    events: VecDeque<Event>,
}

impl Session {
    pub fn client(settings: Http2Settings) -> Self {
        Self::new(Role::Client, settings)
    }

    pub fn server(settings: Http2Settings) -> Self {
        Self::new(Role::Server, settings)
    }

    fn new(role: Role, local: Http2Settings) -> Self {
        let recv_window = local.initial_window_size().max(DEFAULT_CONNECTION_WINDOW);
        let mut session = Self {
            role,
            local,
            peer: PeerSettings::default(),
            codec: FrameCodec::new(local.max_frame_size()),
            encoder: hpack::Encoder::default(),
            decoder: hpack::Decoder::new(local.header_table_size() as usize),
            streams: HashMap::new(),
            next_stream_id: 1,
            last_peer_stream_id: 0,
            send_window: SendWindow::new(DEFAULT_CONNECTION_WINDOW),
            recv_window: RecvWindow::new(recv_window),
            partial_block: None,
            awaiting_preface: role == Role::Server,
            settings_received: false,
            going_away: false,
            peer_going_away: false,
            send_buf: BytesMut::new(),
            events: VecDeque::new(),
        };

        if role == Role::Client {
            session.send_buf.extend_from_slice(PREFACE);
        }
        session.send_frame(Frame::Settings { ack: false, params: SettingsParams::from(&local) });
        if recv_window > DEFAULT_CONNECTION_WINDOW {
            session.send_frame(Frame::WindowUpdate { stream_id: 0, increment: recv_window - DEFAULT_CONNECTION_WINDOW });
        }
        session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Consumes every complete frame in `src`. On error a GOAWAY is queued and the
    /// connection must be closed.
    pub fn recv(&mut self, src: &mut BytesMut) -> Result<(), Http2Error> {
        let result = self.recv_frames(src);
        if let Err(e) = &result {
            error!(cause = %e, code = %e.code(), "http/2 connection error");
            self.go_away(e.code());
        }
        result
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn take_pending_send(&mut self) -> BytesMut {
        self.send_buf.split()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Whether the stream is still open in either direction or has queued output.
    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn is_going_away(&self) -> bool {
        self.going_away || self.peer_going_away
    }

    /// Allocates the next client stream id.
    pub fn open_stream(&mut self) -> Result<u32, Http2Error> {
        ensure!(self.role == Role::Client, Http2Error::protocol("only clients open streams"));
        ensure!(!self.is_going_away(), Http2Error::GoingAway { code: ErrorCode::RefusedStream });
        ensure!(self.next_stream_id <= MAX_STREAM_ID, Http2Error::GoingAway { code: ErrorCode::NoError });

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.streams.insert(stream_id, StreamState::new(self.peer.initial_window_size, self.local.initial_window_size()));
        trace!(stream_id, "opened stream");
        Ok(stream_id)
    }

    pub fn send_headers(&mut self, stream_id: u32, fields: &[HeaderField], end_stream: bool) -> Result<(), Http2Error> {
        let stream = self.writable_stream(stream_id)?;
        stream.local_end = end_stream;
        stream.on_wire = true;

        let mut block = BytesMut::new();
        self.encoder.encode(fields, &mut block);
        self.send_header_block(stream_id, block.freeze(), end_stream);
        self.retire_if_done(stream_id);
        Ok(())
    }

    /// Queues body bytes; they go out as the flow control windows allow.
    pub fn send_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<(), Http2Error> {
        let stream = self.writable_stream(stream_id)?;
        stream.local_end = end_stream;
        stream.queued.push_back(Outbound::Data { data, end_stream });
        self.flush_stream(stream_id);
        Ok(())
    }

    /// Queues trailers, ending the stream once the body before them is sent.
    pub fn send_trailers(&mut self, stream_id: u32, fields: Vec<HeaderField>) -> Result<(), Http2Error> {
        let stream = self.writable_stream(stream_id)?;
        stream.local_end = true;
        stream.queued.push_back(Outbound::Trailers(fields));
        self.flush_stream(stream_id);
        Ok(())
    }

    /// Resets a stream locally; a no-op once the stream is gone.
    pub fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        let Some(stream) = self.streams.remove(&stream_id) else { return };
        debug!(stream_id, code = %code, on_wire = stream.on_wire, "resetting stream");
        if stream.on_wire {
            self.send_frame(Frame::RstStream { stream_id, code });
        }
    }

    /// Sends GOAWAY once; open streams may still finish.
    pub fn go_away(&mut self, code: ErrorCode) {
        if self.going_away {
            return;
        }
        self.going_away = true;
        let last_stream_id = self.last_peer_stream_id;
        debug!(last_stream_id, code = %code, "sending goaway");
        self.send_frame(Frame::GoAway { last_stream_id, code, debug_data: Bytes::new() });
    }

    fn writable_stream(&mut self, stream_id: u32) -> Result<&mut StreamState, Http2Error> {
        match self.streams.get_mut(&stream_id) {
            Some(stream) if !stream.local_end => Ok(stream),
            _ => Err(Http2Error::Stream { stream_id, code: ErrorCode::StreamClosed }),
        }
    }

    fn recv_frames(&mut self, src: &mut BytesMut) -> Result<(), Http2Error> {
        if self.awaiting_preface {
            if src.len() < PREFACE.len() {
                ensure!(PREFACE.starts_with(&src[..]), Http2Error::InvalidPreface);
                return Ok(());
            }
            ensure!(src.starts_with(PREFACE), Http2Error::InvalidPreface);
            src.advance(PREFACE.len());
            self.awaiting_preface = false;
        }

        while let Some(frame) = self.codec.decode(src)? {
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Http2Error> {
        if let Some(partial) = &self.partial_block {
            let continues = matches!(frame, Frame::Continuation { stream_id, .. } if stream_id == partial.stream_id);
            ensure!(continues, Http2Error::protocol("header block interrupted by another frame"));
        }
        if !self.settings_received {
            ensure!(
                matches!(frame, Frame::Settings { ack: false, .. }),
                Http2Error::protocol("the first frame from the peer must be SETTINGS")
            );
        }

        match frame {
            Frame::Settings { ack: true, .. } => trace!("peer acknowledged settings"),
            Frame::Settings { ack: false, params } => self.on_settings(&params)?,
            Frame::Headers { stream_id, block, end_stream, end_headers } => {
                let partial = PartialBlock { stream_id, block: BytesMut::from(&block[..]), end_stream };
                if end_headers {
                    self.on_header_block(partial)?;
                } else {
                    self.partial_block = Some(partial);
                }
            }
            Frame::Continuation { block, end_headers, .. } => {
                let Some(mut partial) = self.partial_block.take() else {
                    return Err(Http2Error::protocol("CONTINUATION without a header block"));
                };
                partial.block.extend_from_slice(&block);
                ensure!(
                    partial.block.len() <= self.local.max_header_list_size() as usize,
                    Http2Error::protocol("header block exceeds the header list limit")
                );
                if end_headers {
                    self.on_header_block(partial)?;
                } else {
                    self.partial_block = Some(partial);
                }
            }
            Frame::Data { stream_id, data, end_stream, padding } => self.on_data(stream_id, data, end_stream, padding)?,
            Frame::RstStream { stream_id, code } => self.on_reset(stream_id, code)?,
            Frame::Ping { ack: false, payload } => self.send_frame(Frame::Ping { ack: true, payload }),
            Frame::Ping { ack: true, .. } => trace!("peer acknowledged ping"),
            Frame::GoAway { last_stream_id, code, .. } => self.on_go_away(last_stream_id, code),
            Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment)?,
            Frame::PushPromise { .. } => return Err(Http2Error::protocol("server push is disabled")),
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn on_settings(&mut self, params: &SettingsParams) -> Result<(), Http2Error> {
        self.settings_received = true;

        if let Some(size) = params.initial_window_size {
            let delta = i64::from(size) - i64::from(self.peer.initial_window_size);
            for stream in self.streams.values_mut() {
                stream.send_window.adjust(delta)?;
            }
        }
        if let Some(size) = params.header_table_size {
            self.encoder.set_max_table_size(size.min(MAX_ENCODER_TABLE_SIZE) as usize);
        }
        self.peer.apply(params);
        debug!(peer = ?self.peer, "applied peer settings");

        self.send_frame(Frame::Settings { ack: true, params: SettingsParams::default() });
        self.flush_all();
        Ok(())
    }

    fn on_header_block(&mut self, partial: PartialBlock) -> Result<(), Http2Error> {
        let PartialBlock { stream_id, block, end_stream } = partial;
        // decoded even for streams we ignore, to keep the hpack tables in step
        let fields = self.decoder.decode(&block)?;

        match self.streams.get(&stream_id).map(|stream| stream.remote_end) {
            Some(true) => {
                self.reset_with(stream_id, ErrorCode::StreamClosed, StreamResetReason::LocalReset);
                return Ok(());
            }
            Some(false) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.remote_end = end_stream;
                }
            }
            None if self.is_idle(stream_id) => {
                ensure!(self.role == Role::Server, Http2Error::protocol("server opened a stream"));
                self.last_peer_stream_id = stream_id;
                if self.going_away || self.streams.len() >= self.local.max_concurrent_streams() as usize {
                    debug!(stream_id, "refusing stream");
                    self.send_frame(Frame::RstStream { stream_id, code: ErrorCode::RefusedStream });
                    return Ok(());
                }
                let mut stream = StreamState::new(self.peer.initial_window_size, self.local.initial_window_size());
                stream.remote_end = end_stream;
                stream.on_wire = true;
                self.streams.insert(stream_id, stream);
                trace!(stream_id, "peer opened stream");
            }
            None => {
                trace!(stream_id, "ignoring headers on a closed stream");
                return Ok(());
            }
        }

        let list_size: usize = fields.iter().map(HeaderField::size).sum();
        if list_size > self.local.max_header_list_size() as usize {
            warn!(stream_id, list_size, "header list exceeds the limit");
            self.reset_with(stream_id, ErrorCode::ProtocolError, StreamResetReason::Overflow);
            return Ok(());
        }

        self.events.push_back(Event::Headers { stream_id, fields, end_stream });
        self.retire_if_done(stream_id);
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool, padding: u32) -> Result<(), Http2Error> {
        let flow_len = data.len() as u32 + padding;
        self.recv_window.consume(flow_len)?;
        if let Some(increment) = self.recv_window.release() {
            self.send_frame(Frame::WindowUpdate { stream_id: 0, increment });
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            ensure!(!self.is_idle(stream_id), Http2Error::protocol("DATA on an idle stream"));
            trace!(stream_id, "ignoring data on a closed stream");
            return Ok(());
        };
        if stream.remote_end {
            self.reset_with(stream_id, ErrorCode::StreamClosed, StreamResetReason::LocalReset);
            return Ok(());
        }
        if stream.recv_window.consume(flow_len).is_err() {
            warn!(stream_id, flow_len, "peer overran the stream window");
            self.reset_with(stream_id, ErrorCode::FlowControlError, StreamResetReason::Overflow);
            return Ok(());
        }

        stream.remote_end = end_stream;
        let update = if end_stream { None } else { stream.recv_window.release() };
        if let Some(increment) = update {
            self.send_frame(Frame::WindowUpdate { stream_id, increment });
        }

        self.events.push_back(Event::Data { stream_id, data, end_stream });
        self.retire_if_done(stream_id);
        Ok(())
    }

    fn on_reset(&mut self, stream_id: u32, code: ErrorCode) -> Result<(), Http2Error> {
        if self.streams.remove(&stream_id).is_some() {
            debug!(stream_id, code = %code, "peer reset stream");
            self.events.push_back(Event::Reset { stream_id, reason: StreamResetReason::RemoteReset });
            return Ok(());
        }
        ensure!(!self.is_idle(stream_id), Http2Error::protocol("RST_STREAM on an idle stream"));
        Ok(())
    }

    fn on_go_away(&mut self, last_stream_id: u32, code: ErrorCode) {
        debug!(last_stream_id, code = %code, "peer is going away");
        self.peer_going_away = true;
        self.events.push_back(Event::GoAway { last_stream_id, code });

        let mut unprocessed: Vec<u32> =
            self.streams.keys().copied().filter(|id| self.is_local(*id) && *id > last_stream_id).collect();
        unprocessed.sort_unstable();
        for stream_id in unprocessed {
            self.streams.remove(&stream_id);
            self.events.push_back(Event::Reset { stream_id, reason: StreamResetReason::RemoteReset });
        }
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Http2Error> {
        if stream_id == 0 {
            ensure!(increment != 0, Http2Error::protocol("WINDOW_UPDATE with a zero increment"));
            self.send_window.increase(increment)?;
            self.flush_all();
            return Ok(());
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            ensure!(!self.is_idle(stream_id), Http2Error::protocol("WINDOW_UPDATE on an idle stream"));
            return Ok(());
        };
        if increment == 0 {
            self.reset_with(stream_id, ErrorCode::ProtocolError, StreamResetReason::LocalReset);
        } else if stream.send_window.increase(increment).is_err() {
            self.reset_with(stream_id, ErrorCode::FlowControlError, StreamResetReason::Overflow);
        } else {
            self.flush_stream(stream_id);
        }
        Ok(())
    }

    /// Never opened by either side yet.
    fn is_idle(&self, stream_id: u32) -> bool {
        match self.role {
            Role::Client => stream_id % 2 == 0 || stream_id >= self.next_stream_id,
            Role::Server => stream_id % 2 == 1 && stream_id > self.last_peer_stream_id,
        }
    }

    fn is_local(&self, stream_id: u32) -> bool {
        (stream_id % 2 == 1) == (self.role == Role::Client)
    }

    fn reset_with(&mut self, stream_id: u32, code: ErrorCode, reason: StreamResetReason) {
        self.reset_stream(stream_id, code);
        self.events.push_back(Event::Reset { stream_id, reason });
    }

    fn retire_if_done(&mut self, stream_id: u32) {
        if self.streams.get(&stream_id).is_some_and(StreamState::is_done) {
            self.streams.remove(&stream_id);
            trace!(stream_id, "stream closed");
        }
    }

    fn flush_all(&mut self) {
        let mut waiting: Vec<u32> =
            self.streams.iter().filter(|(_, stream)| !stream.queued.is_empty()).map(|(id, _)| *id).collect();
        waiting.sort_unstable();
        for stream_id in waiting {
            self.flush_stream(stream_id);
        }
    }

    /// Sends queued output of one stream as far as the windows allow.
    fn flush_stream(&mut self, stream_id: u32) {
        loop {
            let Some(stream) = self.streams.get_mut(&stream_id) else { return };
            let frame_limit = self.peer.max_frame_size as usize;

            match stream.queued.front_mut() {
                None => break,
                Some(Outbound::Trailers(_)) => {
                    let Some(Outbound::Trailers(fields)) = stream.queued.pop_front() else { break };
                    let mut block = BytesMut::new();
                    self.encoder.encode(&fields, &mut block);
                    self.send_header_block(stream_id, block.freeze(), true);
                }
                Some(Outbound::Data { data, end_stream }) => {
                    let window = stream.send_window.available().min(self.send_window.available()).min(frame_limit);
                    if window == 0 && !data.is_empty() {
                        trace!(stream_id, queued = data.len(), "stream is blocked by flow control");
                        break;
                    }

                    let chunk = data.split_to(window.min(data.len()));
                    let last = data.is_empty();
                    let end_stream = last && *end_stream;
                    stream.send_window.consume(chunk.len());
                    self.send_window.consume(chunk.len());
                    if last {
                        stream.queued.pop_front();
                    }
                    self.send_frame(Frame::data(stream_id, chunk, end_stream));
                }
            }
        }
        self.retire_if_done(stream_id);
    }

    fn send_header_block(&mut self, stream_id: u32, mut block: Bytes, end_stream: bool) {
        let frame_limit = self.peer.max_frame_size as usize;
        let first = block.split_to(block.len().min(frame_limit));
        self.send_frame(Frame::Headers { stream_id, block: first, end_stream, end_headers: block.is_empty() });
        while !block.is_empty() {
            let next = block.split_to(block.len().min(frame_limit));
            self.send_frame(Frame::Continuation { stream_id, block: next, end_headers: block.is_empty() });
        }
    }

    fn send_frame(&mut self, frame: Frame) {
        if let Err(e) = self.codec.encode(frame, &mut self.send_buf) {
            error!(cause = %e, "failed to encode frame");
        }
    }
}
