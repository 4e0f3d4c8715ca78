//! Per-piece download state.
//!
//! A [`PieceTable`] tracks, for every piece, which chunks have been received
//! (dirty), whether the piece is queued for or undergoing verification, its
//! cached completion flag and its priority. Pieces with a priority above
//! [`PiecePriority::None`] are kept in a priority-ordered pending set that the
//! request scheduler walks.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::bitmap::Bitmap;
use crate::protocol::Request;
use crate::storage::{PieceDescriptor, PieceStorage, TorrentLayout, TorrentStorage};

/// Download urgency of a piece. Higher variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PiecePriority {
    #[default]
    None,
    Normal,
    Readahead,
    Next,
    Now,
}

impl PiecePriority {
    /// Raises `self` to `other` if that is higher. Returns whether it changed.
    pub fn raise(&mut self, other: PiecePriority) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }
}

/// The externally visible state of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PieceState {
    pub priority: PiecePriority,
    pub complete: bool,
    /// Queued for or undergoing hash verification.
    pub checking: bool,
    /// Some chunks received but not yet verified.
    pub partial: bool,
}

/// A run of consecutive pieces sharing the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceStateRun {
    pub length: u32,
    pub state: PieceState,
}

/// Writes to a piece that have been accepted but not yet reached storage.
///
/// Lives outside the client lock: writers decrement it without holding that
/// lock, and hashing or reading waits for it to drain.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    count: Mutex<usize>,
    idle: Condvar,
}

impl PendingWrites {
    pub(crate) fn increment(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn decrement(&self) {
        let mut count = self.count.lock();
        assert!(*count > 0, "pending write count underflow");
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn wait_none(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }

    pub(crate) fn get(&self) -> usize {
        *self.count.lock()
    }
}

pub(crate) struct Piece {
    pub(crate) desc: PieceDescriptor,
    pub(crate) storage: Arc<dyn PieceStorage>,
    pub(crate) pending_writes: Arc<PendingWrites>,
    dirty: Bitmap,
    /// Priority set through the torrent API; only cancelling lowers it.
    pub(crate) explicit_priority: PiecePriority,
    priority: PiecePriority,
    pub(crate) queued_for_hash: bool,
    pub(crate) hashing: bool,
    /// The next verification may complete the piece without every chunk
    /// having been received in this session.
    pub(crate) recheck: bool,
    pub(crate) ever_hashed: bool,
    pub(crate) num_verifies: u64,
    complete: bool,
    pub(crate) published: PieceState,
}

impl Piece {
    pub(crate) fn priority(&self) -> PiecePriority {
        self.priority
    }
}

pub(crate) struct PieceTable {
    pieces: Vec<Piece>,
    chunk_size: u32,
    completed: Bitmap,
    pending: BTreeSet<(Reverse<PiecePriority>, u32)>,
}

impl PieceTable {
    pub(crate) fn new(layout: &TorrentLayout, storage: &dyn TorrentStorage, chunk_size: u32) -> Self {
        let pieces = (0..layout.num_pieces())
            .map(|i| {
                let desc = layout.piece(i);
                Piece {
                    storage: storage.piece(&desc),
                    desc,
                    pending_writes: Arc::default(),
                    dirty: Bitmap::new(),
                    explicit_priority: PiecePriority::None,
                    priority: PiecePriority::None,
                    queued_for_hash: false,
                    hashing: false,
                    recheck: false,
                    ever_hashed: false,
                    num_verifies: 0,
                    complete: false,
                    published: PieceState::default(),
                }
            })
            .collect();
        Self {
            pieces,
            chunk_size,
            completed: Bitmap::new(),
            pending: BTreeSet::new(),
        }
    }

    pub(crate) fn len(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub(crate) fn get(&self, index: u32) -> &Piece {
        &self.pieces[index as usize]
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> &mut Piece {
        &mut self.pieces[index as usize]
    }

    pub(crate) fn piece_len(&self, index: u32) -> u32 {
        self.get(index).desc.length as u32
    }

    pub(crate) fn num_chunks(&self, index: u32) -> u32 {
        self.piece_len(index).div_ceil(self.chunk_size)
    }

    /// The request covering chunk `chunk` of piece `index`.
    pub(crate) fn chunk_request(&self, index: u32, chunk: u32) -> Request {
        let begin = chunk * self.chunk_size;
        let length = self.chunk_size.min(self.piece_len(index) - begin);
        Request::new(index, begin, length)
    }

    /// Whether `req` is exactly one of our chunk boundaries.
    pub(crate) fn is_chunk(&self, req: &Request) -> bool {
        req.index < self.len()
            && req.begin % self.chunk_size == 0
            && req.begin < self.piece_len(req.index)
            && self.chunk_request(req.index, req.begin / self.chunk_size) == *req
    }

    pub(crate) fn chunk_index(&self, begin: u32) -> u32 {
        begin / self.chunk_size
    }

    pub(crate) fn is_dirty(&self, index: u32, chunk: u32) -> bool {
        self.get(index).dirty.contains(chunk)
    }

    pub(crate) fn mark_dirty(&mut self, index: u32, chunk: u32) -> bool {
        self.get_mut(index).dirty.insert(chunk)
    }

    pub(crate) fn unmark_dirty(&mut self, index: u32, chunk: u32) -> bool {
        self.get_mut(index).dirty.remove(chunk)
    }

    pub(crate) fn clear_dirty(&mut self, index: u32) {
        self.get_mut(index).dirty.clear();
    }

    pub(crate) fn num_dirty(&self, index: u32) -> u32 {
        self.get(index).dirty.len() as u32
    }

    pub(crate) fn all_dirty(&self, index: u32) -> bool {
        self.num_dirty(index) == self.num_chunks(index)
    }

    pub(crate) fn undirtied_chunks(&self, index: u32) -> impl Iterator<Item = u32> + '_ {
        let piece = self.get(index);
        (0..self.num_chunks(index)).filter(move |c| !piece.dirty.contains(*c))
    }

    /// Cached completion.
    pub(crate) fn complete(&self, index: u32) -> bool {
        self.get(index).complete
    }

    /// Updates the cached completion flag. Returns whether it changed.
    pub(crate) fn set_complete(&mut self, index: u32, complete: bool) -> bool {
        let piece = self.get_mut(index);
        if piece.complete == complete {
            return false;
        }
        piece.complete = complete;
        self.completed.set(index, complete);
        true
    }

    pub(crate) fn completed(&self) -> &Bitmap {
        &self.completed
    }

    pub(crate) fn num_complete(&self) -> u32 {
        self.completed.len() as u32
    }

    pub(crate) fn all_complete(&self) -> bool {
        self.num_complete() == self.len()
    }

    /// Sets the effective priority, keeping the pending set in step.
    pub(crate) fn set_priority(&mut self, index: u32, priority: PiecePriority) -> bool {
        let old = self.get(index).priority;
        if old == priority {
            return false;
        }
        self.pending.remove(&(Reverse(old), index));
        if priority != PiecePriority::None {
            self.pending.insert((Reverse(priority), index));
        }
        self.get_mut(index).priority = priority;
        true
    }

    pub(crate) fn priority(&self, index: u32) -> PiecePriority {
        self.get(index).priority
    }

    /// Pieces with a priority, highest priority first, then by index.
    pub(crate) fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.pending.iter().map(|(_, index)| *index)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn state(&self, index: u32) -> PieceState {
        let piece = self.get(index);
        PieceState {
            priority: piece.priority,
            complete: piece.complete,
            checking: piece.queued_for_hash || piece.hashing,
            partial: !piece.complete && !piece.dirty.is_empty(),
        }
    }

    /// Consecutive pieces grouped by state.
    pub(crate) fn state_runs(&self) -> Vec<PieceStateRun> {
        let mut runs: Vec<PieceStateRun> = Vec::new();
        for index in 0..self.len() {
            let state = self.state(index);
            match runs.last_mut() {
                Some(run) if run.state == state => run.length += 1,
                _ => runs.push(PieceStateRun { length: 1, state }),
            }
        }
        runs
    }

    pub(crate) fn bytes_completed(&self) -> u64 {
        self.completed
            .iter()
            .map(|i| self.get(i).desc.length)
            .sum()
    }

    /// Pieces overlapping the byte range `[begin, end)`.
    pub(crate) fn byte_region_pieces(&self, begin: u64, end: u64) -> std::ops::Range<u32> {
        let Some(first) = self.pieces.first() else {
            return 0..0;
        };
        let piece_length = first.desc.length.max(1);
        if end <= begin {
            return 0..0;
        }
        let first_piece = (begin / piece_length).min(self.len() as u64) as u32;
        let last_piece = end.div_ceil(piece_length).min(self.len() as u64) as u32;
        first_piece..last_piece
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageProvider};
    use crate::types::InfoHash;

    fn table(total: u64, piece_length: u64, chunk: u32) -> PieceTable {
        let n = total.div_ceil(piece_length) as usize;
        let layout = TorrentLayout::single_file("t", total, piece_length, vec![[0u8; 20]; n]).unwrap();
        let storage = MemoryStorage::new()
            .open_torrent(InfoHash([0; 20]), &layout)
            .unwrap();
        PieceTable::new(&layout, storage.as_ref(), chunk)
    }

    #[test]
    fn test_priority_raise() {
        let mut p = PiecePriority::Normal;
        assert!(!p.raise(PiecePriority::None));
        assert!(p.raise(PiecePriority::Now));
        assert_eq!(p, PiecePriority::Now);
    }

    #[test]
    fn test_chunk_geometry() {
        let t = table(13, 5, 2);
        assert_eq!(t.num_chunks(0), 3);
        assert_eq!(t.num_chunks(2), 2);
        assert_eq!(t.chunk_request(0, 2), Request::new(0, 4, 1));
        assert!(t.is_chunk(&Request::new(2, 2, 1)));
        assert!(!t.is_chunk(&Request::new(2, 2, 2)));
        assert!(!t.is_chunk(&Request::new(0, 1, 2)));
        assert!(!t.is_chunk(&Request::new(3, 0, 2)));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut t = table(13, 5, 2);
        assert!(t.mark_dirty(0, 1));
        assert!(!t.mark_dirty(0, 1));
        assert_eq!(t.undirtied_chunks(0).collect::<Vec<_>>(), vec![0, 2]);
        t.mark_dirty(0, 0);
        t.mark_dirty(0, 2);
        assert!(t.all_dirty(0));
        assert!(t.state(0).partial);
        t.clear_dirty(0);
        assert_eq!(t.num_dirty(0), 0);
    }

    #[test]
    fn test_pending_order() {
        let mut t = table(40, 5, 5);
        t.set_priority(6, PiecePriority::Normal);
        t.set_priority(1, PiecePriority::Normal);
        t.set_priority(4, PiecePriority::Now);
        t.set_priority(3, PiecePriority::Readahead);
        assert_eq!(t.pending().collect::<Vec<_>>(), vec![4, 3, 1, 6]);

        assert!(t.set_priority(4, PiecePriority::None));
        assert!(!t.set_priority(4, PiecePriority::None));
        assert_eq!(t.pending().collect::<Vec<_>>(), vec![3, 1, 6]);
    }

    #[test]
    fn test_state_runs() {
        let mut t = table(20, 5, 5);
        t.set_complete(1, true);
        t.set_complete(2, true);
        let runs = t.state_runs();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1].length, 2);
        assert!(runs[1].state.complete);
        assert_eq!(t.bytes_completed(), 10);
    }

    #[test]
    fn test_byte_region_pieces() {
        let t = table(13, 5, 5);
        assert_eq!(t.byte_region_pieces(0, 1), 0..1);
        assert_eq!(t.byte_region_pieces(4, 6), 0..2);
        assert_eq!(t.byte_region_pieces(10, 100), 2..3);
        assert_eq!(t.byte_region_pieces(5, 5), 0..0);
    }

    #[test]
    fn test_pending_writes_drain() {
        let pending = Arc::new(PendingWrites::default());
        pending.increment();
        let waiter = {
            let pending = pending.clone();
            std::thread::spawn(move || pending.wait_none())
        };
        pending.decrement();
        waiter.join().unwrap();
        assert_eq!(pending.get(), 0);
    }
}
