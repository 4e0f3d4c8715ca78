//! Piece hash verification.
//!
//! Each torrent has one verifier thread. It takes pieces off the torrent's
//! hash queue one at a time, hashes the stored bytes with the client lock
//! released, and applies the result under the lock. A passing piece is
//! marked complete in storage; a failing one is reopened and the peer that
//! most likely sent the bad data is banned.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::MutexGuard;
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use crate::client::Monitor;
use crate::connection::ConnId;
use crate::piece::PendingWrites;
use crate::storage::{PieceStorage, StorageError};
use crate::torrent::TorrentState;
use crate::types::InfoHash;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// A piece to hash, captured under the lock and run without it.
pub(crate) struct HashJob {
    pub(crate) index: u32,
    length: u64,
    expected: [u8; 20],
    storage: Arc<dyn PieceStorage>,
    pending: Arc<PendingWrites>,
}

impl HashJob {
    /// Waits for in-flight writes to the piece, then hashes it. Blocking.
    pub(crate) fn run(&self) -> Result<bool, StorageError> {
        self.pending.wait_none();
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE.min(self.length as usize)];
        let mut offset = 0u64;
        while offset < self.length {
            let want = buf.len().min((self.length - offset) as usize);
            let n = self.storage.read_at(&mut buf[..want], offset)?;
            if n == 0 {
                return Err(StorageError::OutOfBounds {
                    piece: self.index,
                    offset,
                    length: want,
                });
            }
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(hasher.finalize().as_slice() == self.expected)
    }
}

/// Starts the verifier for one added instance of a torrent. The thread
/// exits once that instance is gone, even if the same info hash has been
/// added again since.
pub(crate) fn spawn(
    monitor: Arc<Monitor>,
    info_hash: InfoHash,
    instance: u64,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("verify-{}", &info_hash.to_hex()[..8]))
        .spawn(move || run(&monitor, info_hash, instance))
}

fn run(monitor: &Monitor, info_hash: InfoHash, instance: u64) {
    let mut state = monitor.lock();
    loop {
        if state.closed {
            break;
        }
        let Some(t) = state
            .torrents
            .get_mut(&info_hash)
            .filter(|t| t.instance == instance && !t.is_closed())
        else {
            break;
        };
        let Some(job) = t.next_hash_job() else {
            monitor.event.wait(&mut state);
            continue;
        };
        trace!(torrent = %info_hash, piece = job.index, "hashing piece");
        let result = MutexGuard::unlocked(&mut state, || job.run());
        if let Some(t) = state
            .torrents
            .get_mut(&info_hash)
            .filter(|t| t.instance == instance)
        {
            t.piece_hashed(job.index, result);
        }
    }
    debug!(torrent = %info_hash, "verifier stopped");
}

impl TorrentState {
    /// Queues a piece for hashing. Does nothing if it is already queued or
    /// being hashed.
    pub(crate) fn queue_piece_check(&mut self, index: u32) -> bool {
        let piece = self.pieces.get_mut(index);
        if piece.queued_for_hash || piece.hashing {
            return false;
        }
        piece.queued_for_hash = true;
        self.hash_queue.push_back(index);
        self.publish_piece_change(index);
        self.broadcast();
        true
    }

    /// Queues every piece for a full recheck. Returns, per piece, the
    /// verification count at which the recheck will have happened.
    pub(crate) fn queue_recheck_all(&mut self) -> Vec<u64> {
        (0..self.num_pieces())
            .map(|index| {
                let piece = self.pieces.get_mut(index);
                piece.recheck = true;
                let target = piece.num_verifies + 1;
                self.queue_piece_check(index);
                target
            })
            .collect()
    }

    pub(crate) fn next_hash_job(&mut self) -> Option<HashJob> {
        while let Some(index) = self.hash_queue.pop_front() {
            let complete = self.pieces.complete(index);
            let piece = self.pieces.get_mut(index);
            piece.queued_for_hash = false;
            if complete && !piece.recheck {
                piece.num_verifies += 1;
                self.publish_piece_change(index);
                self.broadcast();
                continue;
            }
            piece.hashing = true;
            let job = HashJob {
                index,
                length: piece.desc.length,
                expected: piece.desc.hash,
                storage: piece.storage.clone(),
                pending: piece.pending_writes.clone(),
            };
            self.publish_piece_change(index);
            return Some(job);
        }
        None
    }

    /// Applies a hash result.
    ///
    /// A matching hash completes the piece only if every chunk arrived or
    /// the check was an explicit recheck. A mismatch reopens the piece and
    /// bans the least trusted peer among those that sent chunks of it.
    pub(crate) fn piece_hashed(&mut self, index: u32, result: Result<bool, StorageError>) {
        let piece = self.pieces.get_mut(index);
        piece.hashing = false;
        piece.ever_hashed = true;
        piece.num_verifies += 1;
        let recheck = std::mem::take(&mut piece.recheck);
        let storage = piece.storage.clone();
        let all_dirty = self.pieces.all_dirty(index);

        let mut touchers = Vec::new();
        for id in self.conn_ids() {
            if let Some(conn) = self.conns.get_mut(&id) {
                if conn.touched_pieces.remove(&index) {
                    touchers.push(id);
                }
            }
        }

        match result {
            Err(e) => {
                warn!(torrent = %self.info_hash, piece = index, error = %e, "error hashing piece");
                self.pieces.clear_dirty(index);
                self.update_piece_completion(index);
                self.on_incomplete_piece(index);
            }
            Ok(true) if all_dirty || recheck => {
                debug!(torrent = %self.info_hash, piece = index, "piece passed hash check");
                for id in &touchers {
                    if let Some(conn) = self.conns.get_mut(id) {
                        conn.stats.good_pieces_dirtied += 1;
                    }
                }
                if let Err(e) = storage.mark_complete() {
                    warn!(torrent = %self.info_hash, piece = index, error = %e, "error marking piece complete");
                }
                self.update_piece_completion(index);
                self.pieces.clear_dirty(index);
            }
            Ok(true) => {
                trace!(piece = index, "ignoring hash of partially received piece");
            }
            Ok(false) => {
                warn!(
                    torrent = %self.info_hash,
                    piece = index,
                    touchers = touchers.len(),
                    "piece failed hash check"
                );
                for id in &touchers {
                    if let Some(conn) = self.conns.get_mut(id) {
                        conn.stats.bad_pieces_dirtied += 1;
                    }
                }
                if let Some(culprit) = self.least_trusted(&touchers) {
                    let ip = self.conns[&culprit].info.addr.ip();
                    self.ctx.ban_ip(ip);
                    self.drop_connection(culprit, "sent data failing hash check");
                }
                if let Err(e) = storage.mark_not_complete() {
                    warn!(torrent = %self.info_hash, piece = index, error = %e, "error marking piece incomplete");
                }
                self.pieces.clear_dirty(index);
                self.update_piece_completion(index);
                self.on_incomplete_piece(index);
            }
        }

        self.update_piece_priorities([index]);
        self.publish_piece_change(index);
        self.broadcast();
    }

    fn least_trusted(&self, ids: &[ConnId]) -> Option<ConnId> {
        ids.iter()
            .filter_map(|id| self.conns.get(id))
            .min_by_key(|c| (c.stats.net_good_pieces_dirtied(), c.id))
            .map(|c| c.id)
    }
}
