//! Request scheduling.
//!
//! For each connection the scheduler decides whether we are interested in
//! the peer and which chunks to keep requested from it. Pieces are walked in
//! priority order. Within a priority class, pieces are taken either in index
//! order (unbiased, good for streaming) or in the connection's own random
//! inclination (biased, spreads connections over different pieces so they
//! rarely request the same chunks).
//!
//! The number of requests kept outstanding on a connection is bounded by
//! [`PeerConn::nominal_max_requests`].

use std::cmp::Reverse;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng as _, SeedableRng};
use tracing::trace;

use crate::config::RequestOrdering;
use crate::connection::{ConnId, PeerConn};
use crate::constants::INCLINATION_POOL_SIZE;
use crate::piece::PiecePriority;
use crate::protocol::{Message, Request};
use crate::torrent::TorrentState;

/// Hands out random piece permutations and takes them back when
/// connections close.
pub(crate) struct InclinationPool {
    free: Vec<Vec<u32>>,
    num_pieces: u32,
    rng: StdRng,
}

impl InclinationPool {
    pub(crate) fn new(num_pieces: u32, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| rand::rng().random());
        Self {
            free: Vec::new(),
            num_pieces,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub(crate) fn get(&mut self) -> Vec<u32> {
        if let Some(perm) = self.free.pop() {
            return perm;
        }
        let mut perm: Vec<u32> = (0..self.num_pieces).collect();
        perm.shuffle(&mut self.rng);
        perm
    }

    pub(crate) fn put(&mut self, perm: Vec<u32>) {
        if perm.len() == self.num_pieces as usize && self.free.len() < INCLINATION_POOL_SIZE {
            self.free.push(perm);
        }
    }
}

/// Whether a connection should request strictly in piece order.
pub(crate) fn use_unbiased_ordering(
    ordering: RequestOrdering,
    num_conns: usize,
    is_fastest: bool,
    has_readers: bool,
) -> bool {
    match ordering {
        RequestOrdering::Biased => false,
        RequestOrdering::Unbiased => true,
        RequestOrdering::Heuristic => has_readers && (num_conns == 1 || is_fastest),
    }
}

/// The request state a connection should converge to.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DesiredRequests {
    pub(crate) interested: bool,
    /// New requests to issue, in order.
    pub(crate) requests: Vec<Request>,
}

impl TorrentState {
    pub(crate) fn want_piece_index(&self, index: u32) -> bool {
        let piece = self.pieces.get(index);
        !self.pieces.complete(index)
            && !piece.queued_for_hash
            && !piece.hashing
            && piece.priority() != PiecePriority::None
    }

    pub(crate) fn want_chunk(&self, req: &Request) -> bool {
        self.want_piece_index(req.index)
            && !self.pieces.is_dirty(req.index, self.pieces.chunk_index(req.begin))
    }

    fn unbiased_for(&self, id: ConnId) -> bool {
        use_unbiased_ordering(
            self.ctx.config.request_ordering,
            self.conns.len(),
            self.fastest_conn == Some(id),
            !self.readers.is_empty(),
        )
    }

    /// Wanted pieces the peer has, in the order requests should be made.
    pub(crate) fn request_order(&self, conn: &PeerConn, unbiased: bool) -> Vec<u32> {
        let mut order: Vec<u32> = self
            .pieces
            .pending()
            .filter(|&i| conn.peer_has_piece(i) && self.want_piece_index(i))
            .collect();
        if !unbiased {
            order.sort_by_key(|&i| {
                (
                    Reverse(self.pieces.priority(i)),
                    !conn.is_suggested(i),
                    conn.inclination.get(i as usize).copied().unwrap_or(i),
                )
            });
        }
        order
    }

    /// Computes interest and the requests to add for a connection.
    ///
    /// Chunks already requested from another connection are skipped unless
    /// the piece is needed next or now.
    pub(crate) fn desired_requests(&self, id: ConnId) -> Option<DesiredRequests> {
        let conn = self.conns.get(&id)?;
        let mut desired = DesiredRequests::default();
        if self.closed || !self.networking_enabled {
            return Some(desired);
        }
        let max = conn.nominal_max_requests();
        let mut outstanding = conn.requests.len();
        for index in self.request_order(conn, self.unbiased_for(id)) {
            let mut chunks = self.pieces.undirtied_chunks(index).peekable();
            if chunks.peek().is_none() {
                continue;
            }
            desired.interested = true;
            if outstanding >= max {
                break;
            }
            if !conn.can_request_piece(index) {
                continue;
            }
            let urgent = self.pieces.priority(index) >= PiecePriority::Next;
            for chunk in chunks {
                if outstanding >= max {
                    break;
                }
                let req = self.pieces.chunk_request(index, chunk);
                if conn.requests.contains(&req) {
                    continue;
                }
                if !urgent && self.pending_requests.contains_key(&req) {
                    continue;
                }
                desired.requests.push(req);
                outstanding += 1;
            }
        }
        Some(desired)
    }

    /// Brings a connection's interest and requests in line with what is
    /// wanted: cancels stale requests, trims to the pipeline limit, then
    /// issues new ones.
    pub(crate) fn update_requests(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let networking = self.networking_enabled && !self.closed;
        let stale: Vec<Request> = conn
            .requests
            .iter()
            .filter(|r| !networking || !self.want_chunk(r))
            .copied()
            .collect();
        for req in stale {
            self.cancel_request(id, req);
        }

        let conn = &self.conns[&id];
        let max = conn.nominal_max_requests();
        if conn.requests.len() > max {
            let mut excess: Vec<Request> = conn.requests.iter().copied().collect();
            excess.sort_by_key(|r| (self.pieces.priority(r.index), Reverse(*r)));
            excess.truncate(conn.requests.len() - max);
            for req in excess {
                self.cancel_request(id, req);
            }
        }

        let Some(desired) = self.desired_requests(id) else {
            return;
        };
        self.set_interested(id, desired.interested);
        for req in desired.requests {
            self.issue_request(id, req);
        }
    }

    pub(crate) fn update_all_requests(&mut self) {
        for id in self.conn_ids() {
            self.update_requests(id);
        }
    }

    pub(crate) fn set_interested(&mut self, id: ConnId, interested: bool) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.am_interested == interested {
            return;
        }
        conn.am_interested = interested;
        conn.post(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    pub(crate) fn issue_request(&mut self, id: ConnId, req: Request) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if !conn.requests.insert(req) {
            return;
        }
        trace!(conn = %id, piece = req.index, begin = req.begin, "requesting chunk");
        conn.post(Message::Request(req));
        *self.pending_requests.entry(req).or_insert(0) += 1;
    }

    /// Withdraws an outstanding request and tells the peer.
    pub(crate) fn cancel_request(&mut self, id: ConnId, req: Request) {
        if self.forget_request(id, req) {
            if let Some(conn) = self.conns.get(&id) {
                conn.post(Message::Cancel(req));
            }
        }
    }

    /// Drops an outstanding request without messaging the peer. Returns
    /// whether it was outstanding.
    pub(crate) fn forget_request(&mut self, id: ConnId, req: Request) -> bool {
        let removed = self
            .conns
            .get_mut(&id)
            .is_some_and(|conn| conn.requests.remove(&req));
        if removed {
            self.release_pending_request(&req);
        }
        removed
    }

    pub(crate) fn release_pending_request(&mut self, req: &Request) {
        match self.pending_requests.get_mut(req) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pending_requests.remove(req);
            }
            None => debug_assert!(false, "released request {:?} that was not pending", req),
        }
    }
}
