use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use super::error::StoreError;

/// One file of a torrent, positioned in piece-space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the download directory.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the file's first byte in the torrent's concatenated data.
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    /// Inclusive range of piece indices overlapping this file.
    ///
    /// Empty files own no pieces.
    pub fn piece_span(&self, piece_length: u64) -> Option<(u32, u32)> {
        if self.length == 0 {
            return None;
        }
        let first = self.offset / piece_length;
        let last = (self.offset + self.length - 1) / piece_length;
        Some((first as u32, last as u32))
    }
}

/// The immutable shape of a torrent: piece size, files and piece hashes.
///
/// The layout is produced by the metainfo decoder and consumed once when the
/// storage for a torrent is opened.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use swarmcore::TorrentLayout;
///
/// let layout = TorrentLayout::from_files(
///     [0u8; 20],
///     16384,
///     vec![(PathBuf::from("a.bin"), 20000), (PathBuf::from("b.bin"), 5000)],
///     vec![[0u8; 20]; 2],
/// )?;
///
/// assert_eq!(layout.total_length(), 25000);
/// assert_eq!(layout.piece_size(1), 25000 - 16384);
/// assert_eq!(layout.files()[1].offset, 20000);
/// # Ok::<(), swarmcore::StoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    info_hash: [u8; 20],
    piece_length: u64,
    total_length: u64,
    files: Vec<FileEntry>,
    piece_hashes: Vec<[u8; 20]>,
}

impl TorrentLayout {
    /// Creates a layout from files that already carry their offsets.
    pub fn new(
        info_hash: [u8; 20],
        piece_length: u64,
        files: Vec<FileEntry>,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StoreError> {
        if piece_length == 0 {
            return Err(StoreError::InvalidLayout("piece length is zero".into()));
        }
        validate_all_file_paths(&files)?;

        let mut expected_offset = 0u64;
        for file in &files {
            if file.offset != expected_offset {
                return Err(StoreError::InvalidLayout(format!(
                    "file {} starts at {} instead of {}",
                    file.path.display(),
                    file.offset,
                    expected_offset
                )));
            }
            expected_offset += file.length;
        }
        let total_length = expected_offset;

        let piece_count = total_length.div_ceil(piece_length) as usize;
        if piece_hashes.len() != piece_count {
            return Err(StoreError::InvalidLayout(format!(
                "expected {} piece hashes, got {}",
                piece_count,
                piece_hashes.len()
            )));
        }

        Ok(Self {
            info_hash,
            piece_length,
            total_length,
            files,
            piece_hashes,
        })
    }

    /// Creates a layout from `(path, length)` pairs laid end to end.
    pub fn from_files(
        info_hash: [u8; 20],
        piece_length: u64,
        files: Vec<(PathBuf, u64)>,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StoreError> {
        let mut offset = 0u64;
        let entries = files
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry::new(path, length, offset);
                offset += length;
                entry
            })
            .collect();
        Self::new(info_hash, piece_length, entries, piece_hashes)
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Size of the piece in bytes; the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u64 {
        let begin = index as u64 * self.piece_length;
        if begin >= self.total_length {
            return 0;
        }
        (self.total_length - begin).min(self.piece_length)
    }

    /// Byte range of the piece in piece-space.
    pub fn piece_range(&self, index: u32) -> Range<u64> {
        let begin = index as u64 * self.piece_length;
        begin..begin + self.piece_size(index)
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), StoreError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_all_file_paths(files: &[FileEntry]) -> Result<(), StoreError> {
    for file in files {
        validate_file_path(&file.path)?;
    }
    Ok(())
}
