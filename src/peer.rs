//! Known but unconnected peers.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use crate::types::PeerId;

/// Where a peer address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    /// Added explicitly by the caller.
    Direct,
    Tracker,
    Incoming,
    Dht,
    Pex,
}

impl PeerSource {
    /// Lower is dialed first.
    fn rank(self) -> u8 {
        match self {
            PeerSource::Direct => 0,
            PeerSource::Tracker => 1,
            PeerSource::Incoming => 2,
            PeerSource::Dht => 3,
            PeerSource::Pex => 4,
        }
    }
}

/// A candidate peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
    pub source: PeerSource,
    pub supports_encryption: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            addr,
            id: None,
            source,
            supports_encryption: false,
        }
    }
}

type ReserveKey = (u8, u64);

/// Priority-ordered reserve of peers to dial.
///
/// Adding an address that is already present replaces the old entry.
/// When full, a new peer only gets in by displacing a lower-priority one.
#[derive(Debug, Default)]
pub struct PeerReserve {
    order: BTreeMap<ReserveKey, SocketAddr>,
    peers: HashMap<SocketAddr, (ReserveKey, Peer)>,
    next_seq: u64,
}

impl PeerReserve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Inserts a peer, keeping at most `capacity` entries. Returns whether
    /// the peer is in the reserve afterwards.
    pub fn add(&mut self, peer: Peer, capacity: usize) -> bool {
        self.remove(&peer.addr);
        let key = (peer.source.rank(), self.next_seq);
        if self.peers.len() >= capacity {
            let Some((&worst, _)) = self.order.last_key_value() else {
                return false;
            };
            if worst.0 <= key.0 {
                return false;
            }
            if let Some(addr) = self.order.remove(&worst) {
                self.peers.remove(&addr);
            }
        }
        self.next_seq += 1;
        self.order.insert(key, peer.addr);
        self.peers.insert(peer.addr, (key, peer));
        true
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Peer> {
        let (key, peer) = self.peers.remove(addr)?;
        self.order.remove(&key);
        Some(peer)
    }

    /// Takes the highest-priority peer.
    pub fn pop_best(&mut self) -> Option<Peer> {
        let (_, addr) = self.order.pop_first()?;
        self.peers.remove(&addr).map(|(_, peer)| peer)
    }
}
