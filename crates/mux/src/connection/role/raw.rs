use std::sync::Arc;

use crate::connection::{Completion, Core, Dispatch, RoleKind};
use crate::error::ConnError;
use crate::handler::ProtocolHandler;

use super::{RoleStep, unexpected};

/// Passthrough: every read goes to the virtual host's raw protocol, replies go back verbatim.
pub(crate) struct Raw {
    handler: Arc<dyn ProtocolHandler>,
    awaiting: bool,
}

impl Raw {
    pub(crate) fn new(handler: Arc<dyn ProtocolHandler>) -> Self {
        Self { handler, awaiting: false }
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ProtocolHandler> {
        &self.handler
    }

    pub(crate) fn step(&mut self, core: &mut Core) -> Result<RoleStep, ConnError> {
        if self.awaiting {
            return Ok(RoleStep::Wait);
        }
        if core.read_buf.is_empty() {
            return Ok(if core.eof { RoleStep::Close } else { RoleStep::Read });
        }

        let Some(info) = core.info().cloned() else {
            return Err(ConnError::protocol_violation("raw connection without vhost"));
        };
        let data = core.read_buf.split().freeze();
        self.awaiting = true;
        Ok(RoleStep::Dispatch(Dispatch::Raw { handler: Arc::clone(&self.handler), data, info }))
    }

    pub(crate) fn complete(&mut self, core: &mut Core, completion: Completion) -> Result<(), ConnError> {
        let Completion::Raw(result) = completion else {
            return Err(unexpected(&completion, RoleKind::Raw));
        };
        self.awaiting = false;

        match result {
            Ok(Some(reply)) => core.write_buf.extend_from_slice(&reply),
            Ok(None) => {}
            Err(reason) => return Err(ConnError::protocol_violation(format!("raw handler {} failed: {reason}", self.handler.name()))),
        }
        Ok(())
    }
}
