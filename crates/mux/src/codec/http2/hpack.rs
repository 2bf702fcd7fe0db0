//! HPACK header compression, one encoder and one decoder per connection.

use bytes::Bytes;

use crate::protocol::ParseError;

/// Decoded header fields in wire order, pseudo headers included.
pub type HeaderList = Vec<(Vec<u8>, Vec<u8>)>;

pub struct HpackDecoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self { inner: fluke_hpack::Decoder::new() }
    }

    /// Decodes one complete header block; a failure is a connection error.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderList, ParseError> {
        self.inner.decode(block).map_err(|e| ParseError::hpack(format!("{e:?}")))
    }
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HpackDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDecoder").finish_non_exhaustive()
    }
}

pub struct HpackEncoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self { inner: fluke_hpack::Encoder::new() }
    }

    pub fn encode<'a, I>(&mut self, headers: I) -> Bytes
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        Bytes::from(self.inner.encode(headers))
    }
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HpackEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackEncoder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_roundtrip_keeps_order() {
        let mut encoder = HpackEncoder::new();
        let block = encoder.encode(vec![(&b":status"[..], &b"200"[..]), (&b"content-type"[..], &b"text/plain"[..])]);

        let headers = HpackDecoder::new().decode(&block).unwrap();
        assert_eq!(headers, vec![(b":status".to_vec(), b"200".to_vec()), (b"content-type".to_vec(), b"text/plain".to_vec())]);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(HpackDecoder::new().decode(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
