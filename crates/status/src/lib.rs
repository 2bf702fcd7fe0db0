//! Server status reporting for `micro-mux`.
//!
//! [`render`] turns a [`ContextSnapshot`] into the JSON document libwebsockets' server-status
//! plugin emits, every value rendered as a string, so existing dashboards keep working.
//! [`StatusProtocol`] serves that document over plain HTTP (mount it with
//! `callback://lws-server-status`) and over WebSocket, answering every message with a fresh
//! report.

mod protocol;
mod render;

pub use protocol::StatusProtocol;
pub use render::{RenderOptions, render, render_string};
