//! Piece storage.
//!
//! The engine talks to storage through three small traits: a provider that
//! opens per-torrent storage, the per-torrent storage that hands out piece
//! handles, and the piece handle itself with positional reads and writes
//! plus a completion flag.
//!
//! All methods are synchronous. Callers run them off the async executor
//! (verifier thread, blocking tasks or blocking readers).
//!
//! # Backends
//!
//! - [`MemoryStorage`] keeps all data in RAM
//! - [`FileStorage`] maps pieces onto one or more files under a directory
//!
//! # Examples
//!
//! ```
//! use rswarm::storage::{MemoryStorage, StorageProvider, TorrentLayout};
//! use rswarm::InfoHash;
//!
//! # fn example() -> Result<(), rswarm::storage::StorageError> {
//! let layout = TorrentLayout::single_file("a.bin", 13, 5, vec![[0u8; 20]; 3])?;
//! let torrent = MemoryStorage::new().open_torrent(InfoHash([1; 20]), &layout)?;
//! let piece = torrent.piece(&layout.piece(2));
//! piece.write_at(b"xyz", 0)?;
//! let mut buf = [0u8; 3];
//! piece.read_at(&mut buf, 0)?;
//! assert_eq!(&buf, b"xyz");
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! [`FileStorage`] rejects file paths containing `..` or absolute components.

mod error;
mod file;
mod memory;

pub use error::StorageError;
pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::types::InfoHash;
use std::path::PathBuf;
use std::sync::Arc;

/// A file within the torrent's concatenated byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64, offset: u64) -> Self {
        Self {
            path: path.into(),
            length,
            offset,
        }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Location and expected hash of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceDescriptor {
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub hash: [u8; 20],
}

/// The shape of a torrent's data: piece size, hashes and files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    pub piece_length: u64,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
}

impl TorrentLayout {
    /// Builds and validates a layout.
    pub fn new(
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
        files: Vec<FileEntry>,
    ) -> Result<Self, StorageError> {
        if piece_length == 0 {
            return Err(StorageError::Layout("piece length is zero".into()));
        }
        let mut expected_offset = 0;
        for file in &files {
            if file.offset != expected_offset {
                return Err(StorageError::Layout(format!(
                    "file {} starts at {} instead of {}",
                    file.path.display(),
                    file.offset,
                    expected_offset
                )));
            }
            expected_offset += file.length;
        }
        let total_length = expected_offset;
        let want = total_length.div_ceil(piece_length);
        if want != piece_hashes.len() as u64 {
            return Err(StorageError::Layout(format!(
                "{} bytes in {} byte pieces needs {} hashes, got {}",
                total_length,
                piece_length,
                want,
                piece_hashes.len()
            )));
        }
        if want > u32::MAX as u64 {
            return Err(StorageError::Layout("too many pieces".into()));
        }
        Ok(Self {
            piece_length,
            total_length,
            piece_hashes,
            files,
        })
    }

    pub fn single_file(
        name: impl Into<PathBuf>,
        length: u64,
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StorageError> {
        Self::new(piece_length, piece_hashes, vec![FileEntry::new(name, length, 0)])
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_len(&self, index: u32) -> u64 {
        let offset = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(offset))
    }

    pub fn piece(&self, index: u32) -> PieceDescriptor {
        PieceDescriptor {
            index,
            offset: index as u64 * self.piece_length,
            length: self.piece_len(index),
            hash: self.piece_hashes[index as usize],
        }
    }
}

/// Opens storage for torrents.
pub trait StorageProvider: Send + Sync {
    fn open_torrent(
        &self,
        info_hash: InfoHash,
        layout: &TorrentLayout,
    ) -> Result<Box<dyn TorrentStorage>, StorageError>;
}

/// Storage for one torrent.
pub trait TorrentStorage: Send + Sync {
    fn piece(&self, piece: &PieceDescriptor) -> Arc<dyn PieceStorage>;

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Positional access to one piece's bytes, plus its completion flag.
///
/// Offsets are relative to the start of the piece.
pub trait PieceStorage: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, StorageError>;

    fn mark_complete(&self) -> Result<(), StorageError>;

    fn mark_not_complete(&self) -> Result<(), StorageError>;

    /// Whether the backend currently considers the piece complete.
    fn is_complete(&self) -> bool;
}

fn check_bounds(
    piece: &PieceDescriptor,
    offset: u64,
    len: usize,
) -> Result<(), StorageError> {
    if offset + len as u64 > piece.length {
        return Err(StorageError::OutOfBounds {
            piece: piece.index,
            offset,
            length: len,
        });
    }
    Ok(())
}
