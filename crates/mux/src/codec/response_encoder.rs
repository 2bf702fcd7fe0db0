use crate::codec::header::HeaderEncoder;
use crate::protocol::{PayloadSize, SendError};
use bytes::{BufMut, Bytes, BytesMut};
use http::Response;
use tokio_util::codec::Encoder;

/// Encodes a complete, buffered HTTP/1 response: header block then body.
#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Response<Bytes>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Response<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (parts, body) = item.into_parts();
        let payload_size = PayloadSize::new_length(body.len() as u64);

        self.header_encoder.encode((Response::from_parts(parts, ()), payload_size), dst)?;
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_then_body() {
        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode(Response::new(Bytes::from_static(b"hello")), &mut dst).unwrap();
        assert_eq!(&dst[..], &b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello"[..]);
    }
}
