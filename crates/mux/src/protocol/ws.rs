use bytes::Bytes;

/// A complete WebSocket message exchanged with a protocol handler.
///
/// Control frames (ping, pong, close handshake) are answered by the connection itself;
/// handlers only ever see data messages. A handler returns [`WsMessage::Close`] to ask the
/// connection to start the closing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
    Close,
}

impl WsMessage {
    pub fn text<S: Into<String>>(text: S) -> Self {
        WsMessage::Text(text.into())
    }

    pub fn binary<B: Into<Bytes>>(bytes: B) -> Self {
        WsMessage::Binary(bytes.into())
    }

    /// Payload length in bytes, zero for `Close`.
    pub fn len(&self) -> usize {
        match self {
            WsMessage::Text(text) => text.len(),
            WsMessage::Binary(bytes) => bytes.len(),
            WsMessage::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
