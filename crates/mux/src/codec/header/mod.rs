//! HTTP/1 header block codecs.
//!
//! - [`HeaderDecoder`]: parses a request header out of a header pool slot, bounded by the
//!   slot size, and decides how the body is framed
//! - [`HeaderEncoder`]: writes a response status line and header fields

mod header_decoder;
mod header_encoder;

pub use header_decoder::{DEFAULT_MAX_HEADER_BYTES, HeaderDecoder};
pub use header_encoder::HeaderEncoder;
