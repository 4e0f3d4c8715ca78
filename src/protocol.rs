//! Peer wire protocol (BEP-3, BEP-6, BEP-10, BEP-11)
//!
//! Message and handshake codecs, length-prefixed framing over any async
//! stream, and the extension payloads the engine understands.

mod error;
mod extension;
mod handshake;
mod message;
mod transport;

pub use error::ProtocolError;
pub use extension::{ExtendedHandshake, PexMessage, PexPeer};
pub use handshake::{
    decode_header, encode_header, ExtensionBits, Handshake, HANDSHAKE_HEADER_LEN, HANDSHAKE_LEN,
    PROTOCOL,
};
pub use message::{Message, MessageId, Request};
pub use transport::{FrameReader, FrameWriter};

#[cfg(test)]
mod tests;
