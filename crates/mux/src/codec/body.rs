//! HTTP/1 request body decoding.
//!
//! [`BodyDecoder`] yields [`PayloadItem::Chunk`]s as bytes arrive and a final
//! [`PayloadItem::Eof`], for `Content-Length` framed and chunked bodies alike. Chunk extensions
//! and trailer fields are skipped. The total body size is capped, since the connection buffers
//! the whole body before dispatching the request.

use std::cmp;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};

/// Longest chunk size line accepted, extensions included.
const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDecoder {
    kind: Kind,
    max_bytes: usize,
    received: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Length { remaining: u64 },
    Chunked(Chunked),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunked {
    /// hex size line, optionally with extensions
    Size,
    Data { remaining: u64 },
    /// CRLF closing a data chunk
    DataEnd,
    /// trailer lines after the last chunk, until an empty line
    Trailer,
    Done,
}

impl BodyDecoder {
    pub fn new(payload_size: PayloadSize, max_bytes: usize) -> Self {
        let kind = match payload_size {
            PayloadSize::Length(length) => Kind::Length { remaining: length },
            PayloadSize::Chunked => Kind::Chunked(Chunked::Size),
            PayloadSize::Empty => Kind::Empty,
        };
        Self { kind, max_bytes, received: 0 }
    }

    /// Bytes of body delivered so far.
    pub fn received(&self) -> usize {
        self.received
    }

    fn account(&mut self, len: usize) -> Result<(), ParseError> {
        self.received += len;
        ensure!(self.received <= self.max_bytes, ParseError::too_large_body(self.received, self.max_bytes));
        Ok(())
    }
}

impl Decoder for BodyDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.kind {
            Kind::Empty => Ok(Some(PayloadItem::Eof)),

            Kind::Length { remaining: 0 } => Ok(Some(PayloadItem::Eof)),

            Kind::Length { remaining } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = cmp::min(remaining, src.len() as u64) as usize;
                self.account(len)?;
                self.kind = Kind::Length { remaining: remaining - len as u64 };
                Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())))
            }

            Kind::Chunked(state) => self.decode_chunked(state, src),
        }
    }
}

impl BodyDecoder {
    fn decode_chunked(&mut self, mut state: Chunked, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
        loop {
            match state {
                Chunked::Size => {
                    let Some(line) = take_line(src)? else {
                        self.kind = Kind::Chunked(state);
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    trace!(size, "chunk size line");
                    state = if size == 0 { Chunked::Trailer } else { Chunked::Data { remaining: size } };
                }

                Chunked::Data { remaining } => {
                    if src.is_empty() {
                        self.kind = Kind::Chunked(state);
                        return Ok(None);
                    }
                    let len = cmp::min(remaining, src.len() as u64) as usize;
                    self.account(len)?;
                    let left = remaining - len as u64;
                    self.kind = Kind::Chunked(if left == 0 { Chunked::DataEnd } else { Chunked::Data { remaining: left } });
                    return Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())));
                }

                Chunked::DataEnd => {
                    if src.len() < 2 {
                        self.kind = Kind::Chunked(state);
                        return Ok(None);
                    }
                    ensure!(&src[..2] == b"\r\n", ParseError::invalid_body("missing CRLF after chunk data"));
                    src.advance(2);
                    state = Chunked::Size;
                }

                Chunked::Trailer => {
                    let Some(line) = take_line(src)? else {
                        self.kind = Kind::Chunked(state);
                        return Ok(None);
                    };
                    if line.is_empty() {
                        state = Chunked::Done;
                    }
                }

                Chunked::Done => {
                    self.kind = Kind::Chunked(Chunked::Done);
                    return Ok(Some(PayloadItem::Eof));
                }
            }
        }
    }
}

/// Splits off one CRLF terminated line, without the terminator.
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match src.windows(2).position(|window| window == b"\r\n") {
        Some(end) => {
            let line = src.split_to(end);
            src.advance(2);
            Ok(Some(line))
        }
        None => {
            ensure!(src.len() <= MAX_CHUNK_LINE, ParseError::invalid_body("chunk size line too long"));
            Ok(None)
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
    ensure!(!digits.is_empty(), ParseError::invalid_body("empty chunk size"));

    digits.iter().try_fold(0u64, |size, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::invalid_body(format!("invalid chunk size byte {b:#04x}"))),
        };
        size.checked_mul(16)
            .and_then(|size| size.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_body("chunk size overflow"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(decoder: &mut BodyDecoder, src: &mut BytesMut) -> Result<(Vec<u8>, bool), ParseError> {
        let mut body = Vec::new();
        loop {
            match decoder.decode(src)? {
                Some(PayloadItem::Chunk(bytes)) => body.extend_from_slice(&bytes),
                Some(PayloadItem::Eof) => return Ok((body, true)),
                None => return Ok((body, false)),
            }
        }
    }

    #[test]
    fn length_leaves_next_request_alone() {
        let mut decoder = BodyDecoder::new(PayloadSize::Length(10), 1024);
        let mut src = BytesMut::from(&b"1012345678GET / HTTP/1.1"[..]);

        let (body, done) = collect(&mut decoder, &mut src).unwrap();
        assert!(done);
        assert_eq!(body, b"1012345678");
        assert_eq!(&src[..], b"GET / HTTP/1.1");
    }

    #[test]
    fn chunked_across_reads() {
        let mut decoder = BodyDecoder::new(PayloadSize::Chunked, 1024);
        let mut src = BytesMut::from(&b"5;ext=1\r\nhel"[..]);

        let (first, done) = collect(&mut decoder, &mut src).unwrap();
        assert!(!done);
        assert_eq!(first, b"hel");

        src.extend_from_slice(b"lo\r\nA\r\n0123456789\r\n0\r\nX-Trailer: yes\r\n\r\nrest");
        let (second, done) = collect(&mut decoder, &mut src).unwrap();
        assert!(done);
        assert_eq!(second, b"lo0123456789");
        assert_eq!(&src[..], b"rest");
        assert_eq!(decoder.received(), 15);
    }

    #[test]
    fn body_limit() {
        let mut decoder = BodyDecoder::new(PayloadSize::Length(100), 8);
        let mut src = BytesMut::from(&[b'a'; 20][..]);
        assert!(matches!(decoder.decode(&mut src), Err(ParseError::TooLargeBody { .. })));
    }

    #[test]
    fn bad_chunk_size() {
        let mut decoder = BodyDecoder::new(PayloadSize::Chunked, 1024);
        let mut src = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut src).is_err());
    }

    #[test]
    fn empty_is_eof() {
        let mut decoder = BodyDecoder::new(PayloadSize::Empty, 0);
        let mut src = BytesMut::new();
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(PayloadItem::Eof));
    }
}
