//! Core protocol abstractions shared by the connection roles.
//!
//! - **Payload framing**: [`PayloadSize`] from the header, [`PayloadItem`]s from the body decoder
//!
//! - **Request Processing** ([`request`]): [`RequestHeader`] with keep-alive, upgrade and host inspection
//!
//! - **Response Processing** ([`response`]): [`ResponseHead`] and helpers for canned responses
//!
//! - **WebSocket Messages** ([`ws`]): [`WsMessage`] as seen by protocol handlers
//!
//! - **Error Handling** ([`error`]):
//!   - [`ParseError`]: Inbound decoding errors for every role
//!   - [`SendError`]: Outbound encoding errors

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub(crate) use request::has_token;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;
pub use response::status_response;

mod ws;
pub use ws::WsMessage;

mod error;
pub use error::ParseError;
pub use error::SendError;
