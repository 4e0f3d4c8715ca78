use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("out of bounds access: piece {piece}, offset {offset}, length {length}")]
    OutOfBounds { piece: u32, offset: u64, length: usize },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("layout error: {0}")]
    Layout(String),

    #[error("storage closed")]
    Closed,
}
