//! Connection management: dialing, handshakes and admission.
//!
//! Transports are pluggable through [`Dialer`]. When a peer is dialed every
//! enabled transport is tried at once and the first stream wins. The
//! handshake then runs with the configured [`EncryptionPolicy`], falling
//! back to the other obfuscation setting on the same transport when the
//! first attempt fails in a way a retry can fix.
//!
//! Established connections are admitted into a bounded pool. When the pool
//! is full the worst connection may be evicted to make room: connections are
//! ranked by usefulness, then by how recently they helped, then by age.
//!
//! [`EncryptionPolicy`]: crate::config::EncryptionPolicy

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::client::ClientContext;
use crate::config::EncryptionPolicy;
use crate::connection::{ConnHandles, ConnId, ConnInfo, PeerConn};
use crate::constants::{EVICTION_GRACE, UNWANTED_CHUNKS_EVICTION};
use crate::error::HandshakeError;
use crate::peer::{Peer, PeerSource};
use crate::protocol::{ExtensionBits, FrameReader, FrameWriter, Handshake};
use crate::torrent::TorrentState;
use crate::types::InfoHash;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream to a peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

pub type BoxStream = Box<dyn PeerStream>;

/// A transport that can open streams to peers.
pub trait Dialer: Send + Sync {
    /// Name of the transport. `"tcp"` is the plain TCP transport; anything
    /// else counts as an overlay.
    fn network(&self) -> &'static str;

    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxStream>>;
}

/// Dials peers over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn network(&self) -> &'static str {
        "tcp"
    }

    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxStream)
        })
    }
}

/// Stream obfuscation applied before the plaintext handshake.
pub trait Obfuscator: Send + Sync {
    /// Wraps an outgoing stream for the torrent `info_hash`.
    fn initiate(
        &self,
        stream: BoxStream,
        info_hash: InfoHash,
    ) -> BoxFuture<'static, Result<BoxStream, HandshakeError>>;

    /// Detects and unwraps an incoming stream. `skeys` are the info hashes
    /// the peer may be using as the shared secret. Returns whether the
    /// stream was obfuscated.
    fn accept(
        &self,
        stream: BoxStream,
        skeys: Vec<InfoHash>,
    ) -> BoxFuture<'static, Result<(BoxStream, bool), HandshakeError>>;
}

/// Receives DHT nodes announced through the port message.
pub trait DhtPinger: Send + Sync {
    fn ping(&self, addr: SocketAddr);
}

/// A handshaken stream, ready to be admitted.
pub(crate) struct Established {
    pub(crate) info_hash: InfoHash,
    pub(crate) info: ConnInfo,
    pub(crate) reader: FrameReader<ReadHalf<BoxStream>>,
    pub(crate) writer: FrameWriter<WriteHalf<BoxStream>>,
}

/// Why an established connection was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum Rejection {
    #[error("torrent closed")]
    Closed,
    #[error("not accepting connections")]
    NotAccepting,
    #[error("duplicate peer id")]
    Duplicate,
    #[error("connection limit reached")]
    Full,
}

/// Scales the dial timeout down as more peers wait to be dialed, so a long
/// reserve does not stall on unresponsive addresses.
pub(crate) fn reduced_dial_timeout(
    min: Duration,
    nominal: Duration,
    half_open_limit: usize,
    pending_peers: usize,
) -> Duration {
    let limit = half_open_limit.max(1);
    let divisor = u32::try_from((pending_peers + limit) / limit).unwrap_or(u32::MAX);
    (nominal / divisor).max(min)
}

pub(crate) fn enabled_dialers(ctx: &ClientContext) -> Vec<Arc<dyn Dialer>> {
    ctx.dialers
        .iter()
        .filter(|d| {
            if d.network() == "tcp" {
                !ctx.config.disable_tcp
            } else {
                !ctx.config.disable_overlay
            }
        })
        .cloned()
        .collect()
}

/// Dials `addr` on every transport at once. The first stream to connect is
/// returned; streams that connect later are dropped.
pub(crate) async fn dial_first(
    dialers: &[Arc<dyn Dialer>],
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(BoxStream, &'static str), HandshakeError> {
    if dialers.is_empty() {
        return Err(HandshakeError::NoTransport);
    }
    let mut attempts = JoinSet::new();
    for dialer in dialers {
        let dialer = dialer.clone();
        attempts.spawn(async move { (dialer.network(), dialer.dial(addr).await) });
    }
    let race = async {
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((network, Ok(stream))) => return Some((stream, network)),
                Ok((network, Err(e))) => trace!(%addr, network, error = %e, "dial failed"),
                Err(e) => trace!(%addr, error = %e, "dial task failed"),
            }
        }
        None
    };
    let winner = tokio::time::timeout(timeout, race).await;
    // losing attempts are cancelled, and streams they already opened are
    // dropped here, closing them
    attempts.shutdown().await;
    match winner {
        Ok(Some(won)) => Ok(won),
        Ok(None) => Err(HandshakeError::DialFailed(addr)),
        Err(_) => Err(HandshakeError::Timeout),
    }
}

/// Dials a peer and completes the handshake, retrying once with the other
/// obfuscation setting if the policy allows it.
pub(crate) async fn establish_outgoing(
    ctx: &ClientContext,
    info_hash: InfoHash,
    peer: &Peer,
    dial_timeout: Duration,
) -> Result<Established, HandshakeError> {
    let attempts = ctx.config.encryption.attempts(ctx.obfuscator.is_some());
    if attempts.is_empty() {
        return Err(HandshakeError::EncryptionRequired);
    }
    let dialers = enabled_dialers(ctx);
    let (stream, network) = dial_first(&dialers, peer.addr, dial_timeout).await?;
    trace!(addr = %peer.addr, network, "dialed");

    let mut stream = Some(stream);
    let mut last_err = HandshakeError::NoTransport;
    for obfuscate in attempts {
        let stream = match stream.take() {
            Some(stream) => stream,
            None => {
                let same: Vec<Arc<dyn Dialer>> = dialers
                    .iter()
                    .filter(|d| d.network() == network)
                    .cloned()
                    .collect();
                dial_first(&same, peer.addr, dial_timeout).await?.0
            }
        };
        let attempt = initiate_handshake(ctx, stream, info_hash, peer, network, obfuscate);
        match tokio::time::timeout(ctx.config.handshake_timeout, attempt).await {
            Ok(Ok(established)) => return Ok(established),
            Ok(Err(e)) if e.is_recoverable() => {
                debug!(addr = %peer.addr, obfuscate, error = %e, "handshake failed, retrying");
                last_err = e;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(HandshakeError::Timeout),
        }
    }
    Err(last_err)
}

async fn initiate_handshake(
    ctx: &ClientContext,
    stream: BoxStream,
    info_hash: InfoHash,
    peer: &Peer,
    network: &'static str,
    obfuscate: bool,
) -> Result<Established, HandshakeError> {
    let stream = match (&ctx.obfuscator, obfuscate) {
        (Some(obfuscator), true) => obfuscator.initiate(stream, info_hash).await?,
        _ => stream,
    };
    let ours = ExtensionBits::ours(ctx.dht.is_some());
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    writer
        .write_raw(&Handshake::new(ours, info_hash, ctx.peer_id).encode())
        .await?;
    writer.flush().await?;
    let (theirs, their_hash) = reader.read_handshake_header().await?;
    if their_hash != info_hash {
        return Err(HandshakeError::InfoHashMismatch);
    }
    let peer_id = reader.read_peer_id().await?;
    if peer_id == ctx.peer_id {
        ctx.add_doppelganger(peer.addr);
        return Err(HandshakeError::Doppelganger);
    }

    Ok(Established {
        info_hash,
        info: ConnInfo {
            addr: peer.addr,
            peer_id,
            source: peer.source,
            outgoing: true,
            encrypted: obfuscate,
            network,
            extensions: ours.intersect(theirs),
        },
        reader,
        writer,
    })
}

/// Completes the handshake on an accepted stream. `skeys` are the info
/// hashes of the torrents we serve.
pub(crate) async fn receive_handshake(
    ctx: &ClientContext,
    stream: BoxStream,
    addr: SocketAddr,
    network: &'static str,
    skeys: Vec<InfoHash>,
) -> Result<Established, HandshakeError> {
    let policy = ctx.config.encryption;
    let (stream, encrypted) = match &ctx.obfuscator {
        Some(obfuscator) if policy != EncryptionPolicy::Disabled => {
            obfuscator.accept(stream, skeys.clone()).await?
        }
        _ => (stream, false),
    };
    if policy == EncryptionPolicy::Required && !encrypted {
        return Err(HandshakeError::EncryptionRequired);
    }

    let ours = ExtensionBits::ours(ctx.dht.is_some());
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);

    let (theirs, info_hash) = reader.read_handshake_header().await?;
    if !skeys.contains(&info_hash) {
        return Err(HandshakeError::UnknownTorrent);
    }
    writer
        .write_raw(&Handshake::new(ours, info_hash, ctx.peer_id).encode())
        .await?;
    writer.flush().await?;
    let peer_id = reader.read_peer_id().await?;
    if peer_id == ctx.peer_id {
        return Err(HandshakeError::Doppelganger);
    }

    Ok(Established {
        info_hash,
        info: ConnInfo {
            addr,
            peer_id,
            source: PeerSource::Incoming,
            outgoing: false,
            encrypted,
            network,
            extensions: ours.intersect(theirs),
        },
        reader,
        writer,
    })
}

/// Orders connections from worst to best when used in a min-heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WorstConnKey {
    useful: bool,
    last_helpful: Option<Instant>,
    connected_at: Instant,
}

impl TorrentState {
    fn conn_useful(&self, conn: &PeerConn) -> bool {
        if self.seeding() {
            return conn.peer_interested;
        }
        self.pieces.pending().any(|i| conn.peer_has_piece(i))
    }

    fn worst_conn_key(&self, conn: &PeerConn) -> WorstConnKey {
        let mut last_helpful = conn.last_useful_chunk_received;
        if self.seeding() {
            last_helpful = last_helpful.max(conn.last_chunk_sent);
        }
        WorstConnKey {
            useful: self.conn_useful(conn),
            last_helpful,
            connected_at: conn.connected_at,
        }
    }

    fn worst_conn_heap(&self) -> BinaryHeap<Reverse<(WorstConnKey, ConnId)>> {
        self.conns
            .values()
            .map(|c| Reverse((self.worst_conn_key(c), c.id)))
            .collect()
    }

    /// The connection to evict for a better one, if any deserves it.
    pub(crate) fn worst_bad_conn(&self) -> Option<ConnId> {
        let mut heap = self.worst_conn_heap();
        while let Some(Reverse((_, id))) = heap.pop() {
            let stats = &self.conns[&id].stats;
            if stats.unwanted_chunks_received >= UNWANTED_CHUNKS_EVICTION
                && stats.unwanted_chunks_received > stats.useful_chunks_received
            {
                return Some(id);
            }
            if heap.len() >= self.max_established_conns.div_ceil(2)
                && self.conns[&id].connected_at.elapsed() > EVICTION_GRACE
            {
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn accepting_conns(&self) -> bool {
        !self.closed && self.networking_enabled && (self.seeding() || self.need_data())
    }

    pub(crate) fn want_conns(&self) -> bool {
        self.accepting_conns()
            && (self.conns.len() < self.max_established_conns || self.worst_bad_conn().is_some())
    }

    /// Admits a handshaken connection, possibly evicting another.
    pub(crate) fn add_connection(&mut self, info: ConnInfo) -> Result<(ConnId, ConnHandles), Rejection> {
        if self.closed {
            return Err(Rejection::Closed);
        }
        if !self.accepting_conns() {
            return Err(Rejection::NotAccepting);
        }
        let existing = self
            .conns
            .values()
            .find(|c| c.info.peer_id == info.peer_id)
            .map(|c| c.id);
        if let Some(existing) = existing {
            // the side with the lower peer id keeps its outgoing connection
            let lower = self.ctx.peer_id < info.peer_id;
            if info.outgoing != lower {
                return Err(Rejection::Duplicate);
            }
            self.drop_connection(existing, "duplicate peer id");
        }
        if self.conns.len() >= self.max_established_conns {
            let Some(worst) = self.worst_bad_conn() else {
                return Err(Rejection::Full);
            };
            self.drop_connection(worst, "evicted for a new connection");
        }
        Ok(self.insert_conn(info))
    }

    pub(crate) fn insert_conn(&mut self, info: ConnInfo) -> (ConnId, ConnHandles) {
        let id = self.ctx.next_conn_id();
        self.reserve.remove(&info.addr);
        let (mut conn, handles) = PeerConn::new(id, info);
        conn.inclination = self.inclinations.get();
        debug!(
            torrent = %self.info_hash,
            conn = %id,
            addr = %conn.info.addr,
            network = conn.info.network,
            encrypted = conn.info.encrypted,
            "connection established"
        );
        self.conns.insert(id, conn);
        self.broadcast();
        (id, handles)
    }

    /// Changes the connection limit, evicting worst-first down to it.
    pub(crate) fn set_max_established_conns(&mut self, max: usize) -> usize {
        let old = std::mem::replace(&mut self.max_established_conns, max);
        let mut heap = self.worst_conn_heap();
        while self.conns.len() > max {
            let Some(Reverse((_, id))) = heap.pop() else {
                break;
            };
            self.drop_connection(id, "connection limit lowered");
        }
        self.open_new_conns();
        old
    }

    /// Removes and closes a connection, releasing everything it held.
    pub(crate) fn drop_connection(&mut self, id: ConnId, reason: &str) -> bool {
        let Some(mut conn) = self.conns.remove(&id) else {
            return false;
        };
        conn.close();
        debug!(torrent = %self.info_hash, conn = %id, addr = %conn.info.addr, reason, "connection closed");
        for req in std::mem::take(&mut conn.requests) {
            self.release_pending_request(&req);
        }
        self.inclinations.put(std::mem::take(&mut conn.inclination));
        self.retire_conn_stats(&conn);
        if self.fastest_conn == Some(id) {
            self.fastest_conn = None;
        }
        self.update_all_requests();
        self.broadcast();
        self.open_new_conns();
        true
    }

    /// Dials peers from the reserve while connections are wanted and
    /// half-open slots remain.
    pub(crate) fn open_new_conns(&mut self) {
        while !self.reserve.is_empty()
            && self.want_conns()
            && self.half_open.len() < self.ctx.config.half_open_conns_per_torrent
        {
            let Some(peer) = self.reserve.pop_best() else {
                break;
            };
            if peer.id == Some(self.ctx.peer_id)
                || self.ctx.is_banned(peer.addr.ip())
                || self.ctx.is_doppelganger(&peer.addr)
                || self.half_open.contains(&peer.addr)
                || self.conns.values().any(|c| c.info.addr == peer.addr)
            {
                continue;
            }
            self.initiate_conn(peer);
        }
    }

    fn initiate_conn(&mut self, peer: Peer) {
        let (Some(runtime), Some(monitor)) = (self.ctx.runtime.clone(), self.ctx.monitor.upgrade())
        else {
            return;
        };
        let timeout = reduced_dial_timeout(
            self.ctx.config.min_dial_timeout,
            self.ctx.config.nominal_dial_timeout,
            self.ctx.config.half_open_conns_per_torrent,
            self.reserve.len(),
        );
        self.half_open.insert(peer.addr);
        trace!(torrent = %self.info_hash, addr = %peer.addr, ?timeout, "dialing");
        runtime.spawn(crate::client::outgoing_connection(
            monitor,
            self.ctx.clone(),
            self.info_hash,
            peer,
            timeout,
        ));
    }

    /// A dial attempt finished, successfully or not.
    pub(crate) fn no_longer_half_open(&mut self, addr: &SocketAddr) {
        self.half_open.remove(addr);
        self.open_new_conns();
        self.broadcast();
    }
}

#[cfg(test)]
mod tests;
