use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StorageError;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client closed")]
    ClientClosed,

    #[error("torrent closed")]
    TorrentClosed,
}

/// Why a live connection ended.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer broke a protocol rule.
    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("read timed out")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ConnError {
    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        ConnError::Violation(msg.into())
    }
}

/// Failures establishing a connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no transport reached {0}")]
    DialFailed(SocketAddr),

    #[error("no usable transport")]
    NoTransport,

    #[error("handshake timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The obfuscation layer found no shared secret for the stream.
    #[error("no matching obfuscation secret")]
    NoMatchingSecret,

    #[error("obfuscation failed: {0}")]
    Obfuscation(String),

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("unknown info hash")]
    UnknownTorrent,

    #[error("connected to ourselves")]
    Doppelganger,

    #[error("plaintext connection refused")]
    EncryptionRequired,
}

impl HandshakeError {
    /// Whether redialing with the other obfuscation setting may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HandshakeError::NoMatchingSecret
                | HandshakeError::Protocol(ProtocolError::ConnectionClosed)
                | HandshakeError::Protocol(ProtocolError::InvalidHandshake)
        )
    }
}
