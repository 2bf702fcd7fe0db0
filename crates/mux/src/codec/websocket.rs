//! WebSocket framing (RFC 6455).
//!
//! [`FrameDecoder`] reads client frames, which must be masked, and unmasks them.
//! [`FrameEncoder`] writes unmasked server frames. Message reassembly and the control frame
//! protocol live in the WebSocket role, not here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio_util::codec::{Decoder, Encoder};

use crate::ensure;
use crate::protocol::{ParseError, SendError};

const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: usize = 125;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID);
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            _ => return None,
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: Bytes) -> Self {
        Self { fin: true, opcode, payload }
    }

    /// A close frame carrying `code` and an optional reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Status code of a close frame, `None` when the payload carries none.
    pub fn close_code(&self) -> Option<u16> {
        (self.opcode == OpCode::Close && self.payload.len() >= 2).then(|| u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHead {
    fin: bool,
    opcode: OpCode,
    mask: [u8; 4],
    len: usize,
}

#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
    head: Option<FrameHead>,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload, head: None }
    }

    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<FrameHead>, ParseError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let (b0, b1) = (src[0], src[1]);
        ensure!(b0 & 0x70 == 0, ParseError::invalid_frame("reserved bits set without extension"));
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or_else(|| ParseError::invalid_frame(format!("unknown opcode {:#x}", b0 & 0x0F)))?;
        let fin = b0 & 0x80 != 0;
        ensure!(b1 & 0x80 != 0, ParseError::invalid_frame("client frame is not masked"));

        let (len, offset) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            len => (u64::from(len), 2),
        };
        if src.len() < offset + 4 {
            return Ok(None);
        }

        if opcode.is_control() {
            ensure!(fin, ParseError::invalid_frame("fragmented control frame"));
            ensure!(len as usize <= MAX_CONTROL_PAYLOAD, ParseError::invalid_frame("control frame payload over 125 bytes"));
        }
        let len = usize::try_from(len).map_err(|_| ParseError::too_large_frame(usize::MAX, self.max_payload))?;
        ensure!(len <= self.max_payload, ParseError::too_large_frame(len, self.max_payload));

        let mut mask = [0u8; 4];
        mask.copy_from_slice(&src[offset..offset + 4]);
        src.advance(offset + 4);
        Ok(Some(FrameHead { fin, opcode, mask, len }))
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let head = match self.head {
            Some(head) => head,
            None => match self.decode_head(src)? {
                Some(head) => {
                    self.head = Some(head);
                    head
                }
                None => return Ok(None),
            },
        };

        if src.len() < head.len {
            src.reserve(head.len - src.len());
            return Ok(None);
        }

        self.head = None;
        let mut payload = src.split_to(head.len);
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= head.mask[i % 4];
        }
        Ok(Some(Frame { fin: head.fin, opcode: head.opcode, payload: payload.freeze() }))
    }
}

#[derive(Debug, Default)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.payload.len();
        dst.reserve(len + 10);
        dst.put_u8(if item.fin { 0x80 } else { 0 } | item.opcode.as_u8());
        match len {
            0..=125 => dst.put_u8(len as u8),
            126..=0xFFFF => {
                dst.put_u8(126);
                dst.put_u16(len as u16);
            }
            _ => {
                dst.put_u8(127);
                dst.put_u64(len as u64);
            }
        }
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Client side framing, used by tests that play the peer.
    pub(crate) fn masked(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut out = vec![if fin { 0x80 } else { 0 } | opcode.as_u8()];
        match payload.len() {
            len @ 0..=125 => out.push(0x80 | len as u8),
            len @ 126..=0xFFFF => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&mask);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        out
    }

    #[test]
    fn rfc_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn masked_text_frame_in_pieces() {
        let bytes = masked(true, OpCode::Text, b"Hello");
        let mut decoder = FrameDecoder::new(1024);
        let mut src = BytesMut::from(&bytes[..3]);
        assert!(decoder.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&bytes[3..]);
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame, Frame::new(OpCode::Text, Bytes::from_static(b"Hello")));
        assert!(src.is_empty());
    }

    #[test]
    fn extended_length() {
        let payload = vec![7u8; 300];
        let mut src = BytesMut::from(&masked(true, OpCode::Binary, &payload)[..]);
        let frame = FrameDecoder::new(1024).decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn unmasked_and_oversized_frames_fail() {
        let mut src = BytesMut::from(&[0x81u8, 0x01, b'a'][..]);
        assert!(FrameDecoder::new(1024).decode(&mut src).is_err());

        let mut src = BytesMut::from(&masked(true, OpCode::Binary, &[0u8; 64])[..]);
        assert!(matches!(FrameDecoder::new(16).decode(&mut src), Err(ParseError::TooLargeFrame { .. })));

        let mut src = BytesMut::from(&masked(false, OpCode::Ping, b"x")[..]);
        assert!(FrameDecoder::new(1024).decode(&mut src).is_err());
    }

    #[test]
    fn server_frames_are_unmasked() {
        let mut dst = BytesMut::new();
        FrameEncoder.encode(Frame::close(CLOSE_NORMAL, "bye"), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e'][..]);

        let mut dst = BytesMut::new();
        FrameEncoder.encode(Frame::new(OpCode::Binary, Bytes::from(vec![1u8; 200])), &mut dst).unwrap();
        assert_eq!(&dst[..4], &[0x82, 126, 0, 200][..]);
    }

    #[test]
    fn close_code_roundtrip() {
        assert_eq!(Frame::close(CLOSE_GOING_AWAY, "").close_code(), Some(CLOSE_GOING_AWAY));
        assert_eq!(Frame::new(OpCode::Close, Bytes::new()).close_code(), None);
    }
}
