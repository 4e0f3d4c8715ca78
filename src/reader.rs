//! Blocking readers over torrent data.
//!
//! A [`Reader`] is a seekable byte stream over the whole torrent. While it
//! exists, the piece under its position is downloaded at the highest
//! priority and the pieces within its readahead window just below that.
//! Reads block until the bytes at the position are available.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::warn;

use crate::client::Monitor;
use crate::constants::DEFAULT_READAHEAD;
use crate::error::Error;
use crate::piece::PendingWrites;
use crate::storage::PieceStorage;
use crate::torrent::TorrentState;
use crate::types::InfoHash;

/// A seekable, blocking view of a torrent's bytes.
///
/// By default only verified pieces are read. In responsive mode, chunks
/// that have been received but not yet verified are returned too.
///
/// Reads block the calling thread; from async code, use
/// `tokio::task::spawn_blocking`.
pub struct Reader {
    monitor: Arc<Monitor>,
    info_hash: InfoHash,
    id: u64,
    pos: u64,
    length: u64,
    readahead: u64,
    responsive: bool,
}

impl Reader {
    pub(crate) fn new(monitor: Arc<Monitor>, info_hash: InfoHash, id: u64, length: u64) -> Self {
        let reader = Self {
            monitor,
            info_hash,
            id,
            pos: 0,
            length,
            readahead: DEFAULT_READAHEAD,
            responsive: false,
        };
        reader.update_range();
        reader
    }

    /// Bytes past the position to prioritize.
    pub fn set_readahead(&mut self, bytes: u64) {
        self.readahead = bytes;
        self.update_range();
    }

    /// Return received but unverified data instead of waiting for the
    /// piece to pass its hash check.
    pub fn set_responsive(&mut self, responsive: bool) {
        self.responsive = responsive;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn update_range(&self) {
        let mut state = self.monitor.lock();
        if let Some(t) = state.torrents.get_mut(&self.info_hash) {
            let end = self.pos + self.readahead.max(1);
            t.readers.insert(self.id, (self.pos, end));
            t.update_reader_priorities();
        }
    }

    /// Blocks until some bytes at the position can be read.
    fn wait_readable(&self) -> io::Result<ReadableSpan> {
        let mut state = self.monitor.lock();
        loop {
            let t = match state.torrents.get(&self.info_hash) {
                Some(t) if !t.is_closed() => t,
                _ => return Err(io::Error::other(Error::TorrentClosed)),
            };
            if let Some(span) = t.readable_span(self.pos, self.responsive) {
                return Ok(span);
            }
            self.monitor.event.wait(&mut state);
        }
    }
}

/// Bytes of one piece that can be read without waiting.
pub(crate) struct ReadableSpan {
    storage: Arc<dyn PieceStorage>,
    pending: Arc<PendingWrites>,
    offset: u64,
    len: u64,
}

impl TorrentState {
    /// The contiguous readable bytes starting at `pos`, within its piece.
    pub(crate) fn readable_span(&self, pos: u64, responsive: bool) -> Option<ReadableSpan> {
        if pos >= self.layout.total_length {
            return None;
        }
        let index = (pos / self.layout.piece_length) as u32;
        let piece = self.pieces.get(index);
        let offset = pos - piece.desc.offset;
        let end = if self.pieces.complete(index) {
            piece.desc.length
        } else if responsive {
            let mut chunk = self.pieces.chunk_index(offset as u32);
            let mut end = offset;
            while chunk < self.pieces.num_chunks(index) && self.pieces.is_dirty(index, chunk) {
                let req = self.pieces.chunk_request(index, chunk);
                end = (req.begin + req.length) as u64;
                chunk += 1;
            }
            end
        } else {
            offset
        };
        (end > offset).then(|| ReadableSpan {
            storage: piece.storage.clone(),
            pending: piece.pending_writes.clone(),
            offset,
            len: end - offset,
        })
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.length {
            return Ok(0);
        }
        loop {
            let span = self.wait_readable()?;
            span.pending.wait_none();
            let want = buf.len().min(span.len as usize);
            let failure = match span.storage.read_at(&mut buf[..want], span.offset) {
                Ok(0) => io::Error::new(io::ErrorKind::UnexpectedEof, "storage returned no data"),
                Ok(n) => {
                    self.pos += n as u64;
                    self.update_range();
                    return Ok(n);
                }
                Err(e) => io::Error::other(e),
            };

            // Storage may have lost data behind our back. Resync the cached
            // completion and priorities, and give up only if nothing changed.
            warn!(torrent = %self.info_hash, pos = self.pos, error = %failure, "reader storage error");
            let mut state = self.monitor.lock();
            let Some(t) = state.torrents.get_mut(&self.info_hash) else {
                return Err(io::Error::other(Error::TorrentClosed));
            };
            let changed = t.update_all_piece_completions();
            t.update_all_piece_priorities();
            if changed == 0 {
                return Err(failure);
            }
        }
    }
}

impl Seek for Reader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        };
        self.pos = target;
        self.update_range();
        Ok(target)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut state = self.monitor.lock();
        if let Some(t) = state.torrents.get_mut(&self.info_hash) {
            if t.readers.remove(&self.id).is_some() {
                t.update_reader_priorities();
            }
        }
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("info_hash", &self.info_hash)
            .field("pos", &self.pos)
            .field("readahead", &self.readahead)
            .field("responsive", &self.responsive)
            .finish()
    }
}
