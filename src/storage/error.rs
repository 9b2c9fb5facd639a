use thiserror::Error;

/// Errors raised by the piece storage layer.
///
/// These are store-level failures: they are never retried here and are
/// surfaced to whoever owns the download task.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store already open with undrained writes: {0}")]
    AlreadyOpen(String),

    #[error("store is not open")]
    NotOpen,

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("invalid torrent layout: {0}")]
    InvalidLayout(String),
}
