use super::{
    check_bounds, PieceDescriptor, PieceStorage, StorageError, StorageProvider, TorrentLayout,
    TorrentStorage,
};
use crate::bitmap::Bitmap;
use crate::types::InfoHash;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

struct Inner {
    data: RwLock<Vec<u8>>,
    completed: Mutex<Bitmap>,
}

/// Keeps torrent data in memory.
///
/// Opening the same info hash twice returns views of the same buffer, which
/// lets data be preloaded before a torrent is added.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    torrents: Arc<Mutex<HashMap<InfoHash, Arc<Inner>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs data for a torrent, optionally flagging every piece complete.
    pub fn preload(&self, info_hash: InfoHash, layout: &TorrentLayout, data: Vec<u8>, complete: bool) {
        let mut completed = Bitmap::new();
        if complete {
            completed.insert_range(0, layout.num_pieces());
        }
        self.torrents.lock().insert(
            info_hash,
            Arc::new(Inner {
                data: RwLock::new(data),
                completed: Mutex::new(completed),
            }),
        );
    }
}

impl StorageProvider for MemoryStorage {
    fn open_torrent(
        &self,
        info_hash: InfoHash,
        layout: &TorrentLayout,
    ) -> Result<Box<dyn TorrentStorage>, StorageError> {
        let mut torrents = self.torrents.lock();
        let inner = torrents
            .entry(info_hash)
            .or_insert_with(|| {
                Arc::new(Inner {
                    data: RwLock::new(vec![0u8; layout.total_length as usize]),
                    completed: Mutex::new(Bitmap::new()),
                })
            })
            .clone();
        let len = inner.data.read().len() as u64;
        if len != layout.total_length {
            return Err(StorageError::Layout(format!(
                "preloaded {} bytes for a {} byte torrent",
                len, layout.total_length
            )));
        }
        Ok(Box::new(MemoryTorrent { inner }))
    }
}

struct MemoryTorrent {
    inner: Arc<Inner>,
}

impl TorrentStorage for MemoryTorrent {
    fn piece(&self, piece: &PieceDescriptor) -> Arc<dyn PieceStorage> {
        Arc::new(MemoryPiece {
            desc: *piece,
            inner: self.inner.clone(),
        })
    }
}

struct MemoryPiece {
    desc: PieceDescriptor,
    inner: Arc<Inner>,
}

impl PieceStorage for MemoryPiece {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let n = buf.len().min(self.desc.length.saturating_sub(offset) as usize);
        check_bounds(&self.desc, offset, n)?;
        let start = (self.desc.offset + offset) as usize;
        buf[..n].copy_from_slice(&self.inner.data.read()[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        check_bounds(&self.desc, offset, buf.len())?;
        let start = (self.desc.offset + offset) as usize;
        self.inner.data.write()[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn mark_complete(&self) -> Result<(), StorageError> {
        self.inner.completed.lock().insert(self.desc.index);
        Ok(())
    }

    fn mark_not_complete(&self) -> Result<(), StorageError> {
        self.inner.completed.lock().remove(self.desc.index);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.inner.completed.lock().contains(self.desc.index)
    }
}
