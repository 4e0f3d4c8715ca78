//! Upload decisions and servicing of peer requests.
//!
//! There is no periodic unchoke round. A peer is unchoked as soon as it is
//! interested and uploading to it is allowed, and choked again when that
//! stops being true. Leechers get soft reciprocity: we serve up to
//! `upload_slack` bytes beyond what the peer has usefully sent us.

use bytes::Bytes;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::connection::{ConnId, PeerConn};
use crate::constants::{MAX_PEER_REQUESTS, MAX_REQUEST_LENGTH};
use crate::error::ConnError;
use crate::protocol::{Message, Request};
use crate::storage::StorageError;
use crate::torrent::TorrentState;

impl TorrentState {
    pub(crate) fn upload_allowed(&self, conn: &PeerConn) -> bool {
        if self.ctx.config.no_upload {
            return false;
        }
        if self.seeding() {
            return true;
        }
        if !self.pieces.pending().any(|i| conn.peer_has_piece(i)) {
            return false;
        }
        conn.stats.bytes_uploaded
            < conn.stats.useful_bytes_downloaded + self.ctx.config.upload_slack
    }

    /// Chokes or unchokes the peer as allowed and serves its queued
    /// requests until the queue empties or the rate limiter defers us.
    pub(crate) fn upload(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        if !conn.peer_interested {
            return;
        }
        if !self.upload_allowed(conn) {
            self.choke_peer(id);
            return;
        }
        self.unchoke_peer(id);

        loop {
            let Some(conn) = self.conns.get(&id) else {
                return;
            };
            if conn.am_choking || conn.upload_retry_pending {
                return;
            }
            let Some(&req) = conn.peer_requests.front() else {
                return;
            };
            if let Err(wait) = self.ctx.upload_limiter.reserve(req.length as usize) {
                trace!(conn = %id, ?wait, "upload deferred by rate limit");
                self.schedule_upload_retry(id, wait);
                return;
            }
            let read = self.read_chunk(&req);
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            conn.peer_requests.pop_front();
            match read {
                Ok(data) => {
                    conn.stats.chunks_sent += 1;
                    conn.stats.bytes_uploaded += data.len() as u64;
                    conn.last_chunk_sent = Some(Instant::now());
                    conn.post(Message::Piece {
                        index: req.index,
                        begin: req.begin,
                        data,
                    });
                }
                Err(e) => {
                    warn!(conn = %id, piece = req.index, error = %e, "error reading chunk for upload");
                    self.update_piece_completion(req.index);
                    if !self.pieces.complete(req.index) {
                        self.choke_peer(id);
                        return;
                    }
                }
            }
        }
    }

    fn read_chunk(&self, req: &Request) -> Result<Bytes, StorageError> {
        let mut buf = vec![0u8; req.length as usize];
        let n = self
            .pieces
            .get(req.index)
            .storage
            .read_at(&mut buf, req.begin as u64)?;
        if n != buf.len() {
            return Err(StorageError::OutOfBounds {
                piece: req.index,
                offset: req.begin as u64,
                length: req.length as usize,
            });
        }
        Ok(Bytes::from(buf))
    }

    /// Chokes the peer and discards its queued requests, rejecting each one
    /// if the fast extension is in use.
    pub(crate) fn choke_peer(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.am_choking {
            return;
        }
        conn.am_choking = true;
        conn.post(Message::Choke);
        let fast = conn.supports_fast();
        for req in std::mem::take(&mut conn.peer_requests) {
            if fast {
                conn.post(Message::Reject(req));
            }
        }
    }

    pub(crate) fn unchoke_peer(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.am_choking {
            return;
        }
        conn.am_choking = false;
        conn.post(Message::Unchoke);
    }

    fn schedule_upload_retry(&mut self, id: ConnId, wait: Duration) {
        let Some(runtime) = self.ctx.runtime.clone() else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.upload_retry_pending {
            return;
        }
        conn.upload_retry_pending = true;
        let monitor = self.ctx.monitor.clone();
        let info_hash = self.info_hash;
        runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(monitor) = monitor.upgrade() else {
                return;
            };
            let mut state = monitor.lock();
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return;
            };
            if let Some(conn) = t.conns.get_mut(&id) {
                conn.upload_retry_pending = false;
                t.upload(id);
            }
        });
    }

    /// Handles a request from the peer. Requests we cannot serve are
    /// rejected under the fast extension and ignored otherwise.
    pub(crate) fn peer_sent_request(&mut self, id: ConnId, req: Request) -> Result<(), ConnError> {
        if req.index >= self.num_pieces()
            || req.length == 0
            || req.length > MAX_REQUEST_LENGTH
            || req.begin as u64 + req.length as u64 > self.pieces.piece_len(req.index) as u64
        {
            return Err(ConnError::violation(format!("bad request {:?}", req)));
        }
        let have = self.pieces.complete(req.index);
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        let fast = conn.supports_fast();
        let reject = |conn: &PeerConn| {
            if fast {
                conn.post(Message::Reject(req));
            }
        };
        if conn.am_choking {
            reject(conn);
            return Ok(());
        }
        if !conn.peer_interested {
            return Err(ConnError::violation("request while not interested"));
        }
        if !have {
            trace!(conn = %id, piece = req.index, "peer requested piece we lack");
            reject(conn);
            return Ok(());
        }
        if conn.peer_requests.contains(&req) {
            return Ok(());
        }
        if conn.peer_requests.len() >= MAX_PEER_REQUESTS {
            reject(conn);
            return Ok(());
        }
        conn.peer_requests.push_back(req);
        self.upload(id);
        Ok(())
    }

    /// Withdraws a peer request. A piece already queued but not yet written
    /// is pulled back out of the outbox.
    pub(crate) fn peer_sent_cancel(&mut self, id: ConnId, req: Request) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let queued = conn
            .peer_requests
            .iter()
            .position(|r| *r == req)
            .map(|pos| conn.peer_requests.remove(pos))
            .is_some();
        let unsent = !queued && conn.outbox.remove_piece(&req);
        if unsent {
            conn.stats.chunks_sent -= 1;
            conn.stats.bytes_uploaded -= req.length as u64;
        }
        if (queued || unsent) && conn.supports_fast() {
            conn.post(Message::Reject(req));
        }
    }
}

#[cfg(test)]
mod tests;
