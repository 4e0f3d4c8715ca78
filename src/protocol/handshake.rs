use super::error::ProtocolError;
use crate::types::{InfoHash, PeerId};
use bytes::{BufMut, Bytes, BytesMut};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Protocol string, reserved bytes and info hash.
pub const HANDSHAKE_HEADER_LEN: usize = 48;
pub const HANDSHAKE_LEN: usize = 68;

/// The reserved bytes of the handshake, advertising optional extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionBits(pub [u8; 8]);

impl ExtensionBits {
    /// The bits this client advertises.
    pub fn ours(dht: bool) -> Self {
        let mut bits = [0u8; 8];
        bits[5] |= 0x10; // Extension protocol (BEP-10)
        bits[7] |= 0x04; // Fast extension (BEP-6)
        if dht {
            bits[7] |= 0x01;
        }
        Self(bits)
    }

    pub fn supports_extended(&self) -> bool {
        (self.0[5] & 0x10) != 0
    }

    pub fn supports_fast(&self) -> bool {
        (self.0[7] & 0x04) != 0
    }

    pub fn supports_dht(&self) -> bool {
        (self.0[7] & 0x01) != 0
    }

    /// Extensions both sides advertised.
    pub fn intersect(self, other: Self) -> Self {
        let mut out = [0u8; 8];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] & other.0[i];
        }
        Self(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: ExtensionBits,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(reserved: ExtensionBits, info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_slice(&encode_header(self.reserved, &self.info_hash));
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }
}

/// Everything up to and including the info hash.
///
/// The accepting side sends this first and holds its peer id back until it
/// knows which torrent the initiator wants.
pub fn encode_header(reserved: ExtensionBits, info_hash: &InfoHash) -> [u8; HANDSHAKE_HEADER_LEN] {
    let mut out = [0u8; HANDSHAKE_HEADER_LEN];
    out[0] = PROTOCOL.len() as u8;
    out[1..20].copy_from_slice(PROTOCOL);
    out[20..28].copy_from_slice(&reserved.0);
    out[28..48].copy_from_slice(info_hash.as_bytes());
    out
}

pub fn decode_header(data: &[u8]) -> Result<(ExtensionBits, InfoHash), ProtocolError> {
    if data.len() < HANDSHAKE_HEADER_LEN || data[0] as usize != PROTOCOL.len() {
        return Err(ProtocolError::InvalidHandshake);
    }
    if &data[1..20] != PROTOCOL {
        return Err(ProtocolError::InvalidHandshake);
    }
    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&data[20..28]);
    let info_hash = InfoHash::from_bytes(&data[28..48]).ok_or(ProtocolError::InvalidHandshake)?;
    Ok((ExtensionBits(reserved), info_hash))
}
