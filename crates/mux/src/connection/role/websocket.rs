use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::codec::websocket::{
    CLOSE_INTERNAL_ERROR, CLOSE_INVALID_PAYLOAD, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_BIG, Frame, FrameDecoder,
    FrameEncoder, OpCode,
};
use crate::connection::{Completion, Core, Dispatch, RoleKind};
use crate::error::ConnError;
use crate::handler::ProtocolHandler;
use crate::protocol::{ParseError, WsMessage};

use super::{RoleStep, unexpected};

/// An upgraded WebSocket connection bound to one protocol handler.
///
/// Control frames are answered here; complete data messages are dispatched one at a time.
pub(crate) struct WebSocket {
    handler: Arc<dyn ProtocolHandler>,
    decoder: FrameDecoder,
    max_message: usize,
    fragments: Option<(OpCode, BytesMut)>,
    awaiting: bool,
    closing: bool,
}

impl WebSocket {
    pub(crate) fn new(handler: Arc<dyn ProtocolHandler>, max_message: usize) -> Self {
        Self { handler, decoder: FrameDecoder::new(max_message), max_message, fragments: None, awaiting: false, closing: false }
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ProtocolHandler> {
        &self.handler
    }

    pub(crate) fn step(&mut self, core: &mut Core) -> Result<RoleStep, ConnError> {
        if self.awaiting {
            return Ok(RoleStep::Wait);
        }

        loop {
            let frame = match self.decoder.decode(&mut core.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) if core.eof => return Ok(RoleStep::Close),
                Ok(None) => return Ok(RoleStep::Read),
                Err(e) => {
                    let code = match e {
                        ParseError::TooLargeFrame { .. } => CLOSE_TOO_BIG,
                        _ => CLOSE_PROTOCOL_ERROR,
                    };
                    self.send_close(core, code)?;
                    return Err(e.into());
                }
            };
            trace!(conn = %core.id, opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "websocket frame");

            match frame.opcode {
                OpCode::Ping => send(core, Frame::new(OpCode::Pong, frame.payload))?,
                OpCode::Pong => {}
                OpCode::Close => {
                    if !self.closing {
                        let code = frame.close_code().unwrap_or(CLOSE_NORMAL);
                        self.send_close(core, code)?;
                    }
                    debug!(conn = %core.id, code = ?frame.close_code(), "websocket closed by peer");
                    core.shutdown();
                    return Ok(RoleStep::Close);
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if let Some(message) = self.assemble(core, frame)? {
                        let Some(info) = core.info().cloned() else {
                            return Err(ConnError::protocol_violation("websocket without vhost"));
                        };
                        self.awaiting = true;
                        return Ok(RoleStep::Dispatch(Dispatch::WsMessage { handler: Arc::clone(&self.handler), message, info }));
                    }
                }
            }
        }
    }

    /// Adds a data frame to the message being reassembled; returns the message once complete.
    fn assemble(&mut self, core: &mut Core, frame: Frame) -> Result<Option<WsMessage>, ConnError> {
        let (opcode, payload) = match (self.fragments.take(), frame.opcode) {
            (None, OpCode::Continuation) => {
                self.send_close(core, CLOSE_PROTOCOL_ERROR)?;
                return Err(ConnError::protocol_violation("continuation frame without a message"));
            }
            (Some(_), OpCode::Text | OpCode::Binary) => {
                self.send_close(core, CLOSE_PROTOCOL_ERROR)?;
                return Err(ConnError::protocol_violation("new message while a fragmented one is open"));
            }
            (None, opcode) if frame.fin => (opcode, frame.payload),
            (None, opcode) => {
                self.fragments = Some((opcode, BytesMut::from(&frame.payload[..])));
                return Ok(None);
            }
            (Some((opcode, mut buf)), _) => {
                if buf.len() + frame.payload.len() > self.max_message {
                    self.send_close(core, CLOSE_TOO_BIG)?;
                    return Err(ParseError::too_large_frame(buf.len() + frame.payload.len(), self.max_message).into());
                }
                buf.extend_from_slice(&frame.payload);
                if !frame.fin {
                    self.fragments = Some((opcode, buf));
                    return Ok(None);
                }
                (opcode, buf.freeze())
            }
        };

        match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Ok(Some(WsMessage::Text(text))),
                Err(_) => {
                    self.send_close(core, CLOSE_INVALID_PAYLOAD)?;
                    Err(ConnError::protocol_violation("text message is not utf-8"))
                }
            },
            _ => Ok(Some(WsMessage::Binary(payload))),
        }
    }

    fn send_close(&mut self, core: &mut Core, code: u16) -> Result<(), ConnError> {
        if self.closing {
            return Ok(());
        }
        self.closing = true;
        send(core, Frame::close(code, ""))
    }

    pub(crate) fn complete(&mut self, core: &mut Core, completion: Completion) -> Result<(), ConnError> {
        let Completion::Ws(result) = completion else {
            return Err(unexpected(&completion, RoleKind::WebSocket));
        };
        self.awaiting = false;

        let messages = match result {
            Ok(messages) => messages,
            Err(reason) => {
                self.send_close(core, CLOSE_INTERNAL_ERROR)?;
                return Err(ConnError::protocol_violation(format!("websocket handler {} failed: {reason}", self.handler.name())));
            }
        };

        for message in messages {
            match message {
                WsMessage::Text(text) => send(core, Frame::new(OpCode::Text, Bytes::from(text)))?,
                WsMessage::Binary(bytes) => send(core, Frame::new(OpCode::Binary, bytes))?,
                WsMessage::Close => {
                    self.send_close(core, CLOSE_NORMAL)?;
                    core.shutdown();
                    break;
                }
            }
        }
        Ok(())
    }
}

fn send(core: &mut Core, frame: Frame) -> Result<(), ConnError> {
    FrameEncoder.encode(frame, &mut core.write_buf)?;
    Ok(())
}
