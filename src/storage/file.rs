use super::{
    check_bounds, FileEntry, PieceDescriptor, PieceStorage, StorageError, StorageProvider,
    TorrentLayout, TorrentStorage,
};
use crate::bitmap::Bitmap;
use crate::types::InfoHash;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Stores torrent data in files below a base directory.
///
/// Completion flags live in memory, so a reopened torrent starts with every
/// piece incomplete until it is verified.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl StorageProvider for FileStorage {
    fn open_torrent(
        &self,
        _info_hash: InfoHash,
        layout: &TorrentLayout,
    ) -> Result<Box<dyn TorrentStorage>, StorageError> {
        for file in &layout.files {
            validate_file_path(&file.path)?;
        }
        let handles = layout.files.iter().map(|_| Mutex::new(None)).collect();
        Ok(Box::new(FileTorrent {
            files: Arc::new(Files {
                base_path: self.base_path.clone(),
                entries: layout.files.clone(),
                handles,
                completed: Mutex::new(Bitmap::new()),
            }),
        }))
    }
}

struct Files {
    base_path: PathBuf,
    entries: Vec<FileEntry>,
    handles: Vec<Mutex<Option<File>>>,
    completed: Mutex<Bitmap>,
}

/// One contiguous region of a file touched by a piece access.
struct Span {
    file_index: usize,
    file_offset: u64,
    buf_offset: usize,
    length: usize,
}

impl Files {
    fn spans(&self, global_offset: u64, length: usize) -> Vec<Span> {
        let end = global_offset + length as u64;
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.offset < end && f.offset + f.length > global_offset)
            .map(|(file_index, f)| {
                let start = global_offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                Span {
                    file_index,
                    file_offset: start - f.offset,
                    buf_offset: (start - global_offset) as usize,
                    length: (stop - start) as usize,
                }
            })
            .collect()
    }

    fn with_file<T>(
        &self,
        file_index: usize,
        f: impl FnOnce(&mut File) -> std::io::Result<T>,
    ) -> Result<T, StorageError> {
        let mut slot = self.handles[file_index].lock();
        if slot.is_none() {
            let path = self.base_path.join(&self.entries[file_index].path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            trace!(path = %path.display(), "opening storage file");
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            *slot = Some(file);
        }
        match slot.as_mut() {
            Some(file) => Ok(f(file)?),
            None => Err(StorageError::Closed),
        }
    }

    fn close(&self) -> Result<(), StorageError> {
        for handle in &self.handles {
            if let Some(file) = handle.lock().take() {
                file.sync_data()?;
            }
        }
        Ok(())
    }
}

struct FileTorrent {
    files: Arc<Files>,
}

impl TorrentStorage for FileTorrent {
    fn piece(&self, piece: &PieceDescriptor) -> Arc<dyn PieceStorage> {
        Arc::new(FilePiece {
            desc: *piece,
            files: self.files.clone(),
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        self.files.close()
    }
}

struct FilePiece {
    desc: PieceDescriptor,
    files: Arc<Files>,
}

impl PieceStorage for FilePiece {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let n = buf.len().min(self.desc.length.saturating_sub(offset) as usize);
        check_bounds(&self.desc, offset, n)?;
        let mut total = 0;
        for span in self.files.spans(self.desc.offset + offset, n) {
            let dst = &mut buf[span.buf_offset..span.buf_offset + span.length];
            let read = self.files.with_file(span.file_index, |file| {
                file.seek(SeekFrom::Start(span.file_offset))?;
                let mut filled = 0;
                while filled < dst.len() {
                    match file.read(&mut dst[filled..])? {
                        0 => break,
                        k => filled += k,
                    }
                }
                Ok(filled)
            })?;
            total += read;
            if read < span.length {
                break;
            }
        }
        Ok(total)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        check_bounds(&self.desc, offset, buf.len())?;
        for span in self.files.spans(self.desc.offset + offset, buf.len()) {
            let src = &buf[span.buf_offset..span.buf_offset + span.length];
            self.files.with_file(span.file_index, |file| {
                file.seek(SeekFrom::Start(span.file_offset))?;
                file.write_all(src)
            })?;
        }
        Ok(buf.len())
    }

    fn mark_complete(&self) -> Result<(), StorageError> {
        self.files.completed.lock().insert(self.desc.index);
        Ok(())
    }

    fn mark_not_complete(&self) -> Result<(), StorageError> {
        self.files.completed.lock().remove(self.desc.index);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.files.completed.lock().contains(self.desc.index)
    }
}
