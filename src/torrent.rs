//! Per-torrent state and the public [`Torrent`] handle.
//!
//! All mutable torrent state lives in [`TorrentState`], owned by the client
//! state behind the client lock. Connection tasks, the verifier thread and
//! readers lock, act synchronously on the state, and unlock before any I/O.
//! The state's behaviour is spread over the modules that own each concern:
//! request scheduling, uploads, connection admission, verification and
//! readers each add their own `impl TorrentState` block.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::client::{ClientContext, Monitor};
use crate::connection::{ConnId, ConnStats, PeerConn};
use crate::error::Error;
use crate::peer::{Peer, PeerReserve};
use crate::piece::{PiecePriority, PieceState, PieceStateRun, PieceTable};
use crate::protocol::Request;
use crate::reader::Reader;
use crate::scheduler::InclinationPool;
use crate::storage::{TorrentLayout, TorrentStorage};
use crate::types::InfoHash;

const PIECE_EVENT_CAPACITY: usize = 1024;

/// A piece changed its externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStateChange {
    pub index: u32,
    pub state: PieceState,
}

/// A snapshot of torrent activity.
#[derive(Debug, Clone, Default)]
pub struct TorrentStats {
    pub active_peers: usize,
    pub half_open_peers: usize,
    pub pending_peers: usize,
    pub pieces_complete: u32,
    /// Bytes written to peer sockets, framing included.
    pub bytes_written: u64,
    /// Counters summed over live and closed connections.
    pub conns: ConnStats,
}

pub(crate) struct TorrentState {
    pub(crate) ctx: Arc<ClientContext>,
    pub(crate) info_hash: InfoHash,
    /// Distinguishes re-adds of the same info hash.
    pub(crate) instance: u64,
    pub(crate) layout: TorrentLayout,
    storage: Box<dyn TorrentStorage>,
    pub(crate) pieces: PieceTable,

    pub(crate) conns: HashMap<ConnId, PeerConn>,
    pub(crate) half_open: HashSet<SocketAddr>,
    pub(crate) reserve: PeerReserve,
    pub(crate) max_established_conns: usize,
    pub(crate) networking_enabled: bool,
    /// Connection that has delivered useful data fastest.
    pub(crate) fastest_conn: Option<ConnId>,

    /// Outstanding requests across all connections.
    pub(crate) pending_requests: HashMap<Request, usize>,
    pub(crate) inclinations: InclinationPool,

    /// Byte ranges `[begin, end)` each reader wants soon.
    pub(crate) readers: HashMap<u64, (u64, u64)>,
    reader_now: Bitmap,
    reader_readahead: Bitmap,

    pub(crate) hash_queue: VecDeque<u32>,
    pub(crate) closed: bool,

    closed_conn_stats: ConnStats,
    closed_bytes_written: u64,
    piece_events: broadcast::Sender<PieceStateChange>,
}

impl TorrentState {
    pub(crate) fn new(
        ctx: Arc<ClientContext>,
        info_hash: InfoHash,
        layout: TorrentLayout,
        storage: Box<dyn TorrentStorage>,
        chunk_size: u32,
        inclination_seed: Option<u64>,
    ) -> Self {
        let mut pieces = PieceTable::new(&layout, storage.as_ref(), chunk_size);
        for index in 0..pieces.len() {
            let complete = pieces.get(index).storage.is_complete();
            pieces.set_complete(index, complete);
            let state = pieces.state(index);
            pieces.get_mut(index).published = state;
        }
        let (piece_events, _) = broadcast::channel(PIECE_EVENT_CAPACITY);
        let max_established_conns = ctx.config.established_conns_per_torrent;
        Self {
            inclinations: InclinationPool::new(pieces.len(), inclination_seed),
            instance: ctx.next_torrent_instance(),
            ctx,
            info_hash,
            layout,
            storage,
            pieces,
            conns: HashMap::new(),
            half_open: HashSet::new(),
            reserve: PeerReserve::new(),
            max_established_conns,
            networking_enabled: true,
            fastest_conn: None,
            pending_requests: HashMap::new(),
            readers: HashMap::new(),
            reader_now: Bitmap::new(),
            reader_readahead: Bitmap::new(),
            hash_queue: VecDeque::new(),
            closed: false,
            closed_conn_stats: ConnStats::default(),
            closed_bytes_written: 0,
            piece_events,
        }
    }

    pub(crate) fn num_pieces(&self) -> u32 {
        self.pieces.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wakes everything waiting on the client condition.
    pub(crate) fn broadcast(&self) {
        self.ctx.event.notify_all();
    }

    pub(crate) fn conn_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.conns.keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn seeding(&self) -> bool {
        self.ctx.config.seed && !self.ctx.config.no_upload && self.pieces.all_complete()
    }

    pub(crate) fn need_data(&self) -> bool {
        self.pieces.has_pending()
    }

    // Piece state publication

    pub(crate) fn subscribe_piece_changes(&self) -> broadcast::Receiver<PieceStateChange> {
        self.piece_events.subscribe()
    }

    /// Emits an event if the piece's visible state differs from the last one
    /// published.
    pub(crate) fn publish_piece_change(&mut self, index: u32) {
        let state = self.pieces.state(index);
        let piece = self.pieces.get_mut(index);
        if piece.published == state {
            return;
        }
        piece.published = state;
        // no subscribers is fine
        let _ = self.piece_events.send(PieceStateChange { index, state });
    }

    // Priorities

    fn derived_priority(&self, index: u32) -> PiecePriority {
        if self.pieces.complete(index) {
            return PiecePriority::None;
        }
        let mut priority = self.pieces.get(index).explicit_priority;
        if self.reader_now.contains(index) {
            priority.raise(PiecePriority::Now);
        }
        if self.reader_readahead.contains(index) {
            priority.raise(PiecePriority::Readahead);
        }
        priority
    }

    /// Re-derives the priorities of `indices` and tells every connection that
    /// has one of the changed pieces to reconsider its requests.
    pub(crate) fn update_piece_priorities(&mut self, indices: impl IntoIterator<Item = u32>) {
        let mut changed = Vec::new();
        for index in indices {
            if index >= self.num_pieces() {
                continue;
            }
            let priority = self.derived_priority(index);
            if self.pieces.set_priority(index, priority) {
                changed.push(index);
            }
        }
        if changed.is_empty() {
            return;
        }
        let affected: Vec<ConnId> = self
            .conn_ids()
            .into_iter()
            .filter(|id| changed.iter().any(|&i| self.conns[id].peer_has_piece(i)))
            .collect();
        for id in affected {
            self.update_requests(id);
        }
        for index in changed {
            self.publish_piece_change(index);
        }
        self.open_new_conns();
        self.broadcast();
    }

    pub(crate) fn update_all_piece_priorities(&mut self) {
        self.update_piece_priorities(0..self.num_pieces());
    }

    /// Raises the explicit priority of a piece.
    pub(crate) fn set_piece_priority(&mut self, index: u32, priority: PiecePriority) {
        if index >= self.num_pieces() {
            return;
        }
        if self.pieces.get_mut(index).explicit_priority.raise(priority) {
            self.update_piece_priorities([index]);
        }
    }

    pub(crate) fn download_pieces(&mut self, begin: u32, end: u32) {
        let end = end.min(self.num_pieces());
        for index in begin..end {
            self.pieces
                .get_mut(index)
                .explicit_priority
                .raise(PiecePriority::Normal);
        }
        self.update_piece_priorities(begin..end);
    }

    pub(crate) fn cancel_pieces(&mut self, begin: u32, end: u32) {
        let end = end.min(self.num_pieces());
        for index in begin..end {
            self.pieces.get_mut(index).explicit_priority = PiecePriority::None;
        }
        self.update_piece_priorities(begin..end);
    }

    /// Recomputes which pieces readers need now and soon.
    pub(crate) fn update_reader_priorities(&mut self) {
        let mut now = Bitmap::new();
        let mut readahead = Bitmap::new();
        for &(begin, end) in self.readers.values() {
            let range = self.pieces.byte_region_pieces(begin, end.max(begin + 1));
            if range.is_empty() {
                continue;
            }
            now.insert(range.start);
            readahead.insert_range(range.start + 1, range.end);
        }
        let old_now = std::mem::replace(&mut self.reader_now, now);
        let old_readahead = std::mem::replace(&mut self.reader_readahead, readahead);
        let touched: Bitmap = old_now
            .iter()
            .chain(old_readahead.iter())
            .chain(self.reader_now.iter())
            .chain(self.reader_readahead.iter())
            .collect();
        self.update_piece_priorities(touched.iter().collect::<Vec<_>>());
    }

    // Completion

    /// Re-reads completion from storage. Returns whether the cached flag
    /// changed.
    pub(crate) fn update_piece_completion(&mut self, index: u32) -> bool {
        let complete = self.pieces.get(index).storage.is_complete();
        if !self.pieces.set_complete(index, complete) {
            return false;
        }
        if complete {
            self.on_piece_completed(index);
        } else {
            self.on_incomplete_piece(index);
        }
        self.update_piece_priorities([index]);
        self.publish_piece_change(index);
        self.broadcast();
        true
    }

    /// Returns how many cached flags changed.
    pub(crate) fn update_all_piece_completions(&mut self) -> usize {
        (0..self.num_pieces())
            .filter(|&index| self.update_piece_completion(index))
            .count()
    }

    fn on_piece_completed(&mut self, index: u32) {
        debug!(torrent = %self.info_hash, piece = index, "piece completed");
        self.pieces.clear_dirty(index);
        for id in self.conn_ids() {
            let stale: Vec<Request> = self.conns[&id]
                .requests
                .iter()
                .filter(|r| r.index == index)
                .copied()
                .collect();
            for req in stale {
                self.cancel_request(id, req);
            }
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.send_have(index);
            }
            self.update_requests(id);
            self.upload(id);
        }
    }

    pub(crate) fn on_incomplete_piece(&mut self, index: u32) {
        if self.pieces.all_dirty(index) {
            self.pieces.clear_dirty(index);
        }
        if !self.want_piece_index(index) {
            return;
        }
        let having: Vec<ConnId> = self
            .conn_ids()
            .into_iter()
            .filter(|id| self.conns[id].peer_has_piece(index))
            .collect();
        for id in having {
            self.update_requests(id);
        }
    }

    // Peers

    /// Adds candidate peers to the reserve and dials if connections are
    /// wanted.
    pub(crate) fn add_peers(&mut self, peers: impl IntoIterator<Item = Peer>) {
        let capacity = self.ctx.config.torrent_peers_high_water;
        for peer in peers {
            if peer.id == Some(self.ctx.peer_id)
                || self.ctx.is_banned(peer.addr.ip())
                || self.ctx.is_doppelganger(&peer.addr)
            {
                continue;
            }
            self.reserve.add(peer, capacity);
        }
        self.open_new_conns();
    }

    // Lifecycle

    pub(crate) fn stats(&self) -> TorrentStats {
        let mut conns = self.closed_conn_stats;
        let mut bytes_written = self.closed_bytes_written;
        for conn in self.conns.values() {
            conns.add(&conn.stats);
            bytes_written += conn.outbox.bytes_written();
        }
        TorrentStats {
            active_peers: self.conns.len(),
            half_open_peers: self.half_open.len(),
            pending_peers: self.reserve.len(),
            pieces_complete: self.pieces.num_complete(),
            bytes_written,
            conns,
        }
    }

    pub(crate) fn retire_conn_stats(&mut self, conn: &PeerConn) {
        self.closed_conn_stats.add(&conn.stats);
        self.closed_bytes_written += conn.outbox.bytes_written();
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (_, conn) in self.conns.drain() {
            conn.close();
        }
        self.pending_requests.clear();
        self.half_open.clear();
        self.hash_queue.clear();
        if let Err(e) = self.storage.close() {
            warn!(torrent = %self.info_hash, error = %e, "error closing storage");
        }
        self.broadcast();
    }
}

/// A handle to a torrent added to a [`Client`](crate::Client).
///
/// Cheap to clone. Methods fail with [`Error::TorrentClosed`] once the
/// torrent has been dropped from the client.
#[derive(Clone)]
pub struct Torrent {
    monitor: Arc<Monitor>,
    info_hash: InfoHash,
}

impl Torrent {
    pub(crate) fn new(monitor: Arc<Monitor>, info_hash: InfoHash) -> Self {
        Self { monitor, info_hash }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut TorrentState) -> T) -> Result<T, Error> {
        let mut state = self.monitor.lock();
        match state.torrents.get_mut(&self.info_hash) {
            Some(t) if !t.is_closed() => Ok(f(t)),
            _ => Err(Error::TorrentClosed),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn num_pieces(&self) -> Result<u32, Error> {
        self.with_state(|t| t.num_pieces())
    }

    /// Total bytes in the torrent.
    pub fn length(&self) -> Result<u64, Error> {
        self.with_state(|t| t.layout.total_length)
    }

    pub fn add_peers(&self, peers: impl IntoIterator<Item = Peer>) -> Result<(), Error> {
        self.with_state(|t| t.add_peers(peers))
    }

    /// Wants pieces `[begin, end)` at normal priority.
    pub fn download_pieces(&self, begin: u32, end: u32) -> Result<(), Error> {
        self.with_state(|t| t.download_pieces(begin, end))
    }

    /// Drops the explicit priority of pieces `[begin, end)`.
    pub fn cancel_pieces(&self, begin: u32, end: u32) -> Result<(), Error> {
        self.with_state(|t| t.cancel_pieces(begin, end))
    }

    pub fn download_all(&self) -> Result<(), Error> {
        self.with_state(|t| t.download_pieces(0, t.num_pieces()))
    }

    /// Raises a piece's priority. Lowering happens only through
    /// [`cancel_pieces`](Self::cancel_pieces).
    pub fn set_piece_priority(&self, index: u32, priority: PiecePriority) -> Result<(), Error> {
        self.with_state(|t| t.set_piece_priority(index, priority))
    }

    pub fn piece_state(&self, index: u32) -> Result<Option<PieceState>, Error> {
        self.with_state(|t| (index < t.num_pieces()).then(|| t.pieces.state(index)))
    }

    pub fn piece_state_runs(&self) -> Result<Vec<PieceStateRun>, Error> {
        self.with_state(|t| t.pieces.state_runs())
    }

    /// Subscribes to piece state changes. Only changes are sent.
    pub fn subscribe_piece_changes(&self) -> Result<broadcast::Receiver<PieceStateChange>, Error> {
        self.with_state(|t| t.subscribe_piece_changes())
    }

    pub fn stats(&self) -> Result<TorrentStats, Error> {
        self.with_state(|t| t.stats())
    }

    pub fn bytes_completed(&self) -> Result<u64, Error> {
        self.with_state(|t| t.pieces.bytes_completed())
    }

    pub fn bytes_missing(&self) -> Result<u64, Error> {
        self.with_state(|t| t.layout.total_length - t.pieces.bytes_completed())
    }

    pub fn is_complete(&self) -> Result<bool, Error> {
        self.with_state(|t| t.pieces.all_complete())
    }

    pub fn seeding(&self) -> Result<bool, Error> {
        self.with_state(|t| t.seeding())
    }

    /// Changes the connection limit, evicting the worst connections if
    /// there are now too many. Returns the previous limit.
    pub fn set_max_established_conns(&self, max: usize) -> Result<usize, Error> {
        self.with_state(|t| t.set_max_established_conns(max))
    }

    /// Stops or resumes requesting data and dialing peers.
    pub fn set_networking_enabled(&self, enabled: bool) -> Result<(), Error> {
        self.with_state(|t| {
            t.networking_enabled = enabled;
            for id in t.conn_ids() {
                t.update_requests(id);
            }
            t.open_new_conns();
        })
    }

    /// Opens a blocking reader over the torrent's bytes.
    pub fn new_reader(&self) -> Result<Reader, Error> {
        let (id, length) = self.with_state(|t| (t.ctx.next_reader_id(), t.layout.total_length))?;
        Ok(Reader::new(self.monitor.clone(), self.info_hash, id, length))
    }

    /// Re-hashes every piece and blocks until all have been checked.
    pub fn verify_data(&self) -> Result<(), Error> {
        let mut state = self.monitor.lock();
        let targets = {
            let t = match state.torrents.get_mut(&self.info_hash) {
                Some(t) if !t.is_closed() => t,
                _ => return Err(Error::TorrentClosed),
            };
            t.queue_recheck_all()
        };
        loop {
            let Some(t) = state.torrents.get(&self.info_hash) else {
                return Err(Error::TorrentClosed);
            };
            if t.is_closed() {
                return Err(Error::TorrentClosed);
            }
            let done = targets
                .iter()
                .enumerate()
                .all(|(i, &target)| t.pieces.get(i as u32).num_verifies >= target);
            if done {
                return Ok(());
            }
            self.monitor.event.wait(&mut state);
        }
    }

    /// Removes the torrent from its client.
    pub fn close(&self) {
        let mut state = self.monitor.lock();
        if let Some(mut t) = state.torrents.remove(&self.info_hash) {
            t.close();
        }
    }
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("info_hash", &self.info_hash)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests;
