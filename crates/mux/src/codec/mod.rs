//! Wire codecs for every protocol role.
//!
//! All codecs implement `tokio_util::codec::{Decoder, Encoder}` over `BytesMut` and never touch
//! a socket; the connection state machine feeds them its buffers.
//!
//! - HTTP/1:
//!   - [`HeaderDecoder`]: request header block, bounded by the header pool slot size
//!   - [`BodyDecoder`]: `Content-Length` and chunked request bodies
//!   - [`ResponseEncoder`]: buffered responses
//! - [`websocket`]: RFC 6455 frames and the handshake accept key
//! - [`http2`]: frame splitting and HPACK

mod body;
mod header;
pub mod http2;
mod response_encoder;
pub mod websocket;

pub use body::BodyDecoder;
pub use header::{DEFAULT_MAX_HEADER_BYTES, HeaderDecoder, HeaderEncoder};
pub use response_encoder::ResponseEncoder;
