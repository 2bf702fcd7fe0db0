//! HTTP/2 framing.
//!
//! Splits the byte stream into frames (9 byte header + payload) and serializes outgoing
//! frames. Frame semantics, stream states and flow control belong to the HTTP/2 role.

mod hpack;

pub use hpack::{HeaderList, HpackDecoder, HpackEncoder};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ensure;
use crate::protocol::{ParseError, SendError};

/// Client connection preface, sent before the first frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
pub const DEFAULT_WINDOW: u32 = 65_535;
pub const MAX_WINDOW: u32 = (1 << 31) - 1;

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
}

pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameKind {
    fn from_u8(kind: u8) -> Self {
        match kind {
            0x0 => FrameKind::Data,
            0x1 => FrameKind::Headers,
            0x2 => FrameKind::Priority,
            0x3 => FrameKind::RstStream,
            0x4 => FrameKind::Settings,
            0x5 => FrameKind::PushPromise,
            0x6 => FrameKind::Ping,
            0x7 => FrameKind::GoAway,
            0x8 => FrameKind::WindowUpdate,
            0x9 => FrameKind::Continuation,
            other => FrameKind::Unknown(other),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0x0,
            FrameKind::Headers => 0x1,
            FrameKind::Priority => 0x2,
            FrameKind::RstStream => 0x3,
            FrameKind::Settings => 0x4,
            FrameKind::PushPromise => 0x5,
            FrameKind::Ping => 0x6,
            FrameKind::GoAway => 0x7,
            FrameKind::WindowUpdate => 0x8,
            FrameKind::Continuation => 0x9,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// One frame with its payload still in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    pub stream: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, flags: u8, stream: u32, payload: Bytes) -> Self {
        Self { kind, flags, stream, payload }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn settings(values: &[(u16, u32)]) -> Self {
        let mut payload = BytesMut::with_capacity(values.len() * 6);
        for (id, value) in values {
            payload.put_u16(*id);
            payload.put_u32(*value);
        }
        Self::new(FrameKind::Settings, 0, 0, payload.freeze())
    }

    pub fn settings_ack() -> Self {
        Self::new(FrameKind::Settings, flags::ACK, 0, Bytes::new())
    }

    pub fn ping_ack(payload: Bytes) -> Self {
        Self::new(FrameKind::Ping, flags::ACK, 0, payload)
    }

    pub fn window_update(stream: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment & MAX_WINDOW);
        Self::new(FrameKind::WindowUpdate, 0, stream, payload.freeze())
    }

    pub fn rst_stream(stream: u32, code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(code);
        Self::new(FrameKind::RstStream, 0, stream, payload.freeze())
    }

    pub fn goaway(last_stream: u32, code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_stream & MAX_WINDOW);
        payload.put_u32(code);
        Self::new(FrameKind::GoAway, 0, 0, payload.freeze())
    }

    pub fn data(stream: u32, payload: Bytes, end_stream: bool) -> Self {
        Self::new(FrameKind::Data, if end_stream { flags::END_STREAM } else { 0 }, stream, payload)
    }

    /// The payload read as a big endian u32 with the reserved bit cleared.
    pub fn u31_at(&self, offset: usize) -> Result<u32, ParseError> {
        ensure!(self.payload.len() >= offset + 4, ParseError::invalid_frame(format!("{:?} frame too short", self.kind)));
        let mut buf = &self.payload[offset..offset + 4];
        Ok(buf.get_u32() & MAX_WINDOW)
    }

    /// `(id, value)` pairs of a SETTINGS frame.
    pub fn setting_values(&self) -> Result<Vec<(u16, u32)>, ParseError> {
        ensure!(self.payload.len() % 6 == 0, ParseError::invalid_frame("settings payload not a multiple of 6"));
        let mut buf = &self.payload[..];
        let mut values = Vec::with_capacity(buf.len() / 6);
        while buf.has_remaining() {
            values.push((buf.get_u16(), buf.get_u32()));
        }
        Ok(values)
    }

    /// HEADERS/DATA payload without padding and priority fields.
    pub fn content(&self) -> Result<Bytes, ParseError> {
        let mut payload = self.payload.clone();
        let mut pad = 0usize;
        if self.has(flags::PADDED) {
            ensure!(!payload.is_empty(), ParseError::invalid_frame("padded frame without pad length"));
            pad = payload.get_u8() as usize;
        }
        if self.kind == FrameKind::Headers && self.has(flags::PRIORITY) {
            ensure!(payload.len() >= 5, ParseError::invalid_frame("priority fields missing"));
            payload.advance(5);
        }
        ensure!(pad <= payload.len(), ParseError::invalid_frame("padding exceeds payload"));
        payload.truncate(payload.len() - pad);
        Ok(payload)
    }
}

/// Splits a header block into one HEADERS frame and as many CONTINUATION frames as needed.
pub fn header_frames(stream: u32, block: Bytes, end_stream: bool, max_frame_size: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut block = block;
    let mut kind = FrameKind::Headers;
    loop {
        let chunk = block.split_to(block.len().min(max_frame_size));
        let mut bits = 0;
        if kind == FrameKind::Headers && end_stream {
            bits |= flags::END_STREAM;
        }
        if block.is_empty() {
            bits |= flags::END_HEADERS;
        }
        frames.push(Frame::new(kind, bits, stream, chunk));
        if block.is_empty() {
            return frames;
        }
        kind = FrameKind::Continuation;
    }
}

#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = (usize::from(src[0]) << 16) | (usize::from(src[1]) << 8) | usize::from(src[2]);
        ensure!(len <= self.max_frame_size, ParseError::too_large_frame(len, self.max_frame_size));
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(FRAME_HEADER_LEN);
        header.advance(3);
        let kind = FrameKind::from_u8(header.get_u8());
        let flags = header.get_u8();
        let stream = header.get_u32() & MAX_WINDOW;
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { kind, flags, stream, payload }))
    }
}

#[derive(Debug, Default)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        if len >= 1 << 24 {
            return Err(SendError::invalid_body(format!("frame payload of {len} bytes")));
        }
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_uint(len as u64, 3);
        dst.put_u8(item.kind.as_u8());
        dst.put_u8(item.flags);
        dst.put_u32(item.stream & MAX_WINDOW);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
