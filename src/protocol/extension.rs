//! Extension protocol payloads (BEP-10) and peer exchange (BEP-11).

use super::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use serde_bencode::value::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// The bencoded dictionary exchanged as extended message 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// Extension name to the id the sender wants to receive it on.
    pub extensions: HashMap<String, u8>,
    /// Extensions the sender turned off by advertising id 0.
    pub disabled: Vec<String>,
    pub client: Option<String>,
    pub reqq: Option<i64>,
    pub port: Option<u16>,
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshake {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut m = HashMap::new();
        for (name, id) in &self.extensions {
            m.insert(name.as_bytes().to_vec(), Value::Int(*id as i64));
        }

        let mut dict = HashMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), Value::Bytes(client.as_bytes().to_vec()));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(b"reqq".to_vec(), Value::Int(reqq));
        }
        if let Some(port) = self.port {
            dict.insert(b"p".to_vec(), Value::Int(port as i64));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size));
        }
        Ok(Bytes::from(serde_bencode::to_bytes(&Value::Dict(dict))?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let Value::Dict(dict) = serde_bencode::from_bytes::<Value>(data)? else {
            return Err(ProtocolError::Extension("handshake is not a dict".into()));
        };

        let mut hs = Self::default();
        if let Some(Value::Dict(m)) = dict.get(b"m".as_slice()) {
            for (key, val) in m {
                let Ok(name) = std::str::from_utf8(key) else {
                    continue;
                };
                match val {
                    Value::Int(0) => hs.disabled.push(name.to_string()),
                    Value::Int(id @ 1..=255) => {
                        hs.extensions.insert(name.to_string(), *id as u8);
                    }
                    _ => {}
                }
            }
        }
        if let Some(Value::Bytes(v)) = dict.get(b"v".as_slice()) {
            hs.client = Some(String::from_utf8_lossy(v).into_owned());
        }
        if let Some(Value::Int(reqq)) = dict.get(b"reqq".as_slice()) {
            hs.reqq = Some(*reqq);
        }
        if let Some(Value::Int(port)) = dict.get(b"p".as_slice()) {
            hs.port = u16::try_from(*port).ok();
        }
        if let Some(Value::Int(size)) = dict.get(b"metadata_size".as_slice()) {
            hs.metadata_size = Some(*size);
        }
        Ok(hs)
    }
}

/// A peer advertised through PEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub supports_encryption: bool,
    pub seed: bool,
}

/// A `ut_pex` payload. Only additions matter to the peer reserve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let Value::Dict(dict) = serde_bencode::from_bytes::<Value>(data)? else {
            return Err(ProtocolError::Extension("pex payload is not a dict".into()));
        };
        let bytes_of = |key: &[u8]| bytes_field(&dict, key);

        let mut msg = Self::default();
        for (compact, flags, stride) in [
            (bytes_of(b"added"), bytes_of(b"added.f"), 6),
            (bytes_of(b"added6"), bytes_of(b"added6.f"), 18),
        ] {
            for (i, addr) in compact.chunks_exact(stride).filter_map(parse_compact).enumerate() {
                let f = flags.get(i).copied().unwrap_or(0);
                msg.added.push(PexPeer {
                    addr,
                    supports_encryption: f & 0x01 != 0,
                    seed: f & 0x02 != 0,
                });
            }
        }
        for (compact, stride) in [(bytes_of(b"dropped"), 6), (bytes_of(b"dropped6"), 18)] {
            msg.dropped
                .extend(compact.chunks_exact(stride).filter_map(parse_compact));
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut dict = HashMap::new();
        let (v4, v6): (Vec<&PexPeer>, Vec<&PexPeer>) =
            self.added.iter().partition(|p: &&PexPeer| p.addr.is_ipv4());
        for (key, flag_key, peers) in [
            (&b"added"[..], &b"added.f"[..], v4),
            (&b"added6"[..], &b"added6.f"[..], v6),
        ] {
            if peers.is_empty() {
                continue;
            }
            let mut compact = BytesMut::new();
            let mut flags = Vec::with_capacity(peers.len());
            for p in peers {
                put_compact(&mut compact, &p.addr);
                flags.push(u8::from(p.supports_encryption) | (u8::from(p.seed) << 1));
            }
            dict.insert(key.to_vec(), Value::Bytes(compact.to_vec()));
            dict.insert(flag_key.to_vec(), Value::Bytes(flags));
        }
        let mut dropped = BytesMut::new();
        let mut dropped6 = BytesMut::new();
        for addr in &self.dropped {
            match addr {
                SocketAddr::V4(_) => put_compact(&mut dropped, addr),
                SocketAddr::V6(_) => put_compact(&mut dropped6, addr),
            }
        }
        if !dropped.is_empty() {
            dict.insert(b"dropped".to_vec(), Value::Bytes(dropped.to_vec()));
        }
        if !dropped6.is_empty() {
            dict.insert(b"dropped6".to_vec(), Value::Bytes(dropped6.to_vec()));
        }
        Ok(Bytes::from(serde_bencode::to_bytes(&Value::Dict(dict))?))
    }
}

fn bytes_field<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &[u8]) -> &'a [u8] {
    match dict.get(key) {
        Some(Value::Bytes(b)) => b.as_slice(),
        _ => &[],
    }
}

fn parse_compact(raw: &[u8]) -> Option<SocketAddr> {
    match raw.len() {
        6 => {
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            (port != 0).then(|| SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        18 => {
            let octets: [u8; 16] = raw[..16].try_into().ok()?;
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            (port != 0).then(|| SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
        }
        _ => None,
    }
}

fn put_compact(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(a) => buf.put_slice(&a.ip().octets()),
        SocketAddr::V6(a) => buf.put_slice(&a.ip().octets()),
    }
    buf.put_u16(addr.port());
}
