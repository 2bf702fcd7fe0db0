//! Protocol roles: the closed set of behaviors a connection can run.

mod http1;
mod http2;
mod raw;
mod websocket;

pub(crate) use http1::Http1;
pub(crate) use http2::Http2;
pub(crate) use raw::Raw;
pub(crate) use websocket::WebSocket;

use std::sync::Arc;

use crate::connection::{Completion, Core, Dispatch, RoleKind};
use crate::error::ConnError;
use crate::handler::ProtocolHandler;

pub(crate) enum Role {
    Http1(Http1),
    Http2(Box<Http2>),
    WebSocket(WebSocket),
    Raw(Raw),
}

/// What a role wants after consuming the read buffer.
pub(crate) enum RoleStep {
    Read,
    Lease,
    Dispatch(Dispatch),
    Wait,
    Close,
    /// Replace the current role; the buffers stay with the connection.
    Switch(Role),
}

impl Role {
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Role::Http1(_) => RoleKind::Http1,
            Role::Http2(_) => RoleKind::Http2,
            Role::WebSocket(_) => RoleKind::WebSocket,
            Role::Raw(_) => RoleKind::Raw,
        }
    }

    pub(crate) fn step(&mut self, core: &mut Core) -> Result<RoleStep, ConnError> {
        match self {
            Role::Http1(http1) => http1.step(core),
            Role::Http2(http2) => http2.step(core),
            Role::WebSocket(websocket) => websocket.step(core),
            Role::Raw(raw) => raw.step(core),
        }
    }

    pub(crate) fn complete(&mut self, core: &mut Core, completion: Completion) -> Result<(), ConnError> {
        match self {
            Role::Http1(http1) => http1.complete(core, completion),
            Role::Http2(http2) => http2.complete(core, completion),
            Role::WebSocket(websocket) => websocket.complete(core, completion),
            Role::Raw(raw) => raw.complete(core, completion),
        }
    }

    /// Protocol handler to notify when the connection closes.
    pub(crate) fn handler(&self) -> Option<&Arc<dyn ProtocolHandler>> {
        match self {
            Role::Http1(_) | Role::Http2(_) => None,
            Role::WebSocket(websocket) => Some(websocket.handler()),
            Role::Raw(raw) => Some(raw.handler()),
        }
    }

    pub(crate) fn parsing_header(&self, core: &Core) -> bool {
        match self {
            Role::Http1(http1) => http1.parsing_header(core),
            Role::Http2(_) | Role::WebSocket(_) | Role::Raw(_) => false,
        }
    }
}

fn unexpected(completion: &Completion, role: RoleKind) -> ConnError {
    ConnError::protocol_violation(format!("{role:?} role can't take completion {completion:?}"))
}
