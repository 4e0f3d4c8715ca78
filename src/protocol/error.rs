use thiserror::Error;

/// Errors raised while framing or decoding the peer wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something other than a BitTorrent handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// A message id we do not understand.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A message whose payload length does not match its id.
    #[error("bad length {length} for {kind} message")]
    BadLength { kind: &'static str, length: usize },

    /// A frame longer than we accept.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// A malformed extension payload.
    #[error("extension error: {0}")]
    Extension(String),

    /// The stream ended.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<serde_bencode::Error> for ProtocolError {
    fn from(err: serde_bencode::Error) -> Self {
        ProtocolError::Extension(err.to_string())
    }
}
