use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, trace};

use super::error::StoreError;
use super::layout::TorrentLayout;
use super::piece::{sha1_digest, Piece, PieceDescriptor};
use crate::constants::{DEFAULT_WRITE_BUFFER, RESUME_SAMPLE_SIZE};
use crate::peer::Bitfield;

pub(crate) type SharedBitfield = Arc<RwLock<Bitfield>>;

/// How a store decides which pieces are already on disk when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCheck {
    /// Treat a piece as present when any of its first `bytes` bytes is
    /// non-zero. Fast, but a partially written piece passes.
    Sample { bytes: usize },
    /// Hash every piece that lies wholly inside the file; boundary pieces
    /// shared with other files fall back to sampling.
    Verify,
    /// Assume nothing is on disk.
    Disabled,
}

impl Default for ResumeCheck {
    fn default() -> Self {
        ResumeCheck::Sample {
            bytes: RESUME_SAMPLE_SIZE,
        }
    }
}

/// Storage settings applied to every store of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub write_buffer_size: u64,
    pub resume_check: ResumeCheck,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: DEFAULT_WRITE_BUFFER,
            resume_check: ResumeCheck::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct FileWindow {
    path: PathBuf,
    begin_pos: u64,
    end_pos: u64,
    span: Option<(u32, u32)>,
}

impl FileWindow {
    fn length(&self) -> u64 {
        self.end_pos - self.begin_pos
    }

    fn owns(&self, index: u32) -> bool {
        matches!(self.span, Some((first, last)) if index >= first && index <= last)
    }

    /// Part of the piece-space range that falls inside this file.
    fn clip(&self, begin: u64, end: u64) -> Option<(u64, u64)> {
        let begin = begin.max(self.begin_pos);
        let end = end.min(self.end_pos);
        (begin < end).then_some((begin, end))
    }
}

struct StoreState {
    window: Option<FileWindow>,
    pieces: Bitfield,
    bad_pieces: Bitfield,
    downloading: Bitfield,
    pending: VecDeque<Piece>,
    buffered: u64,
    downloaded: u64,
    closed: bool,
}

/// Persists and serves one file's share of a torrent's pieces.
///
/// Piece indices are torrent-wide. A store owns every piece whose byte range
/// intersects its file; the first and last of those may be shared with the
/// neighbouring files.
///
/// All bitmap and buffer mutation happens under a single lock, which makes
/// the `downloading -> pieces` and `downloading -> bad` transitions atomic.
/// File I/O happens outside that lock.
pub struct PieceStore {
    layout: Arc<TorrentLayout>,
    have: SharedBitfield,
    options: StoreOptions,
    state: Mutex<StoreState>,
    file: TokioMutex<Option<File>>,
}

impl PieceStore {
    pub(crate) fn new(layout: Arc<TorrentLayout>, have: SharedBitfield, options: StoreOptions) -> Self {
        let piece_count = layout.piece_count();
        Self {
            layout,
            have,
            options,
            state: Mutex::new(StoreState {
                window: None,
                pieces: Bitfield::new(piece_count),
                bad_pieces: Bitfield::new(piece_count),
                downloading: Bitfield::new(piece_count),
                pending: VecDeque::new(),
                buffered: 0,
                downloaded: 0,
                closed: true,
            }),
            file: TokioMutex::new(None),
        }
    }

    /// Opens (creating if needed) the file at `path`, which occupies
    /// `length` bytes starting at `start_offset` in piece-space, then scans
    /// it for pieces that are already present.
    pub async fn open(&self, path: PathBuf, length: u64, start_offset: u64) -> Result<(), StoreError> {
        let piece_length = self.layout.piece_length();
        let window = FileWindow {
            path: path.clone(),
            begin_pos: start_offset,
            end_pos: start_offset + length,
            span: (length > 0).then(|| {
                (
                    (start_offset / piece_length) as u32,
                    ((start_offset + length - 1) / piece_length) as u32,
                )
            }),
        };

        {
            let state = self.state.lock();
            if !state.pending.is_empty() {
                return Err(StoreError::AlreadyOpen(path.display().to_string()));
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let resumed = self.resume_scan(&mut file, &window).await?;

        {
            let mut state = self.state.lock();
            state.pieces.clear_all();
            state.bad_pieces.clear_all();
            state.downloading.clear_all();
            state.buffered = 0;
            state.downloaded = 0;
            let mut have = self.have.write();
            for &index in &resumed {
                state.pieces.set(index as usize);
                state.downloaded += self.overlap(&window, index);
                have.set(index as usize);
            }
            state.window = Some(window.clone());
        }
        *self.file.lock().await = Some(file);
        self.state.lock().closed = false;

        info!(
            path = %path.display(),
            length,
            start_offset,
            span = ?window.span,
            resumed = resumed.len(),
            "piece store opened"
        );
        Ok(())
    }

    async fn resume_scan(&self, file: &mut File, window: &FileWindow) -> Result<Vec<u32>, StoreError> {
        let Some((first, last)) = window.span else {
            return Ok(Vec::new());
        };

        let mut resumed = Vec::new();
        for index in first..=last {
            let range = self.layout.piece_range(index);
            let Some((begin, end)) = window.clip(range.start, range.end) else {
                continue;
            };
            let file_offset = begin - window.begin_pos;

            let present = match self.options.resume_check {
                ResumeCheck::Disabled => false,
                ResumeCheck::Verify if begin == range.start && end == range.end => {
                    let data = read_at(file, file_offset, (end - begin) as usize).await?;
                    self.layout
                        .piece_hash(index)
                        .is_some_and(|hash| sha1_digest(&data) == *hash)
                }
                ResumeCheck::Verify => {
                    let sample = RESUME_SAMPLE_SIZE.min((end - begin) as usize);
                    has_data(&read_at(file, file_offset, sample).await?)
                }
                ResumeCheck::Sample { bytes } => {
                    let sample = bytes.min((end - begin) as usize);
                    has_data(&read_at(file, file_offset, sample).await?)
                }
            };

            if present {
                trace!(piece = index, "piece found on disk");
                resumed.push(index);
            }
        }
        Ok(resumed)
    }

    /// Selects the lowest-index piece the peer has and this file still needs.
    ///
    /// Failed pieces are skipped by this pick and become eligible again
    /// afterwards. The returned piece is marked as downloading.
    pub fn pick(&self, peer_pieces: &Bitfield) -> Option<PieceDescriptor> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let (first, last) = state.window.as_ref()?.span?;

        let candidate = (first..=last).find(|&index| {
            let i = index as usize;
            peer_pieces.has(i)
                && !state.pieces.has(i)
                && !state.bad_pieces.has(i)
                && !state.downloading.has(i)
        });
        state.bad_pieces.clear_all();

        let index = candidate?;
        let hash = *self.layout.piece_hash(index)?;
        state.downloading.set(index as usize);
        debug!(piece = index, "piece picked");
        Some(PieceDescriptor::new(
            index,
            self.layout.piece_size(index) as u32,
            hash,
        ))
    }

    /// Marks a piece picked through another store as downloading here too.
    pub(crate) fn reserve(&self, index: u32) {
        let mut state = self.state.lock();
        if state.window.as_ref().is_some_and(|w| w.owns(index)) {
            state.downloading.set(index as usize);
        }
    }

    /// Buffers a verified piece, writing the buffer out once it is large
    /// enough or the file is complete.
    pub async fn put(&self, piece: &Piece) -> Result<(), StoreError> {
        let batch = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StoreError::NotOpen);
            }
            let Some(window) = state.window.clone() else {
                return Err(StoreError::NotOpen);
            };
            let overlap = self.overlap(&window, piece.index);
            if overlap == 0 {
                return Ok(());
            }
            if piece.len() as u64 != self.layout.piece_size(piece.index) {
                return Err(StoreError::InvalidPieceIndex(piece.index));
            }

            let index = piece.index as usize;
            state.downloading.clear(index);
            if state.pieces.has(index) {
                return Ok(());
            }

            state.pending.push_back(piece.clone());
            state.pieces.set(index);
            self.have.write().set(index);
            state.buffered += overlap;
            state.downloaded += overlap;

            if state.buffered >= self.options.write_buffer_size || state.downloaded == window.length() {
                state.buffered = 0;
                Some((window, state.pending.drain(..).collect::<Vec<_>>()))
            } else {
                None
            }
        };

        if let Some((window, batch)) = batch {
            self.write(&window, batch).await?;
        }
        Ok(())
    }

    /// Marks a piece as failed and no longer downloading.
    pub fn undone(&self, index: u32) {
        let mut state = self.state.lock();
        if !state.window.as_ref().is_some_and(|w| w.owns(index)) {
            return;
        }
        state.bad_pieces.set(index as usize);
        state.downloading.clear(index as usize);
        debug!(piece = index, "piece undone");
    }

    /// Reads `length` bytes starting `offset` bytes into the piece, clipped
    /// to this file.
    ///
    /// Returns `None` when the piece is not owned by this file, or has not
    /// been downloaded and `ignore_have_check` is false.
    pub async fn read(
        &self,
        index: u32,
        length: u32,
        offset: u32,
        ignore_have_check: bool,
    ) -> Result<Option<Bytes>, StoreError> {
        let (window, pending) = {
            let state = self.state.lock();
            let Some(window) = state.window.clone() else {
                return Err(StoreError::NotOpen);
            };
            if !window.owns(index) {
                return Ok(None);
            }
            if !ignore_have_check && !state.pieces.has(index as usize) {
                return Ok(None);
            }
            let pending = state.pending.iter().find(|p| p.index == index).cloned();
            (window, pending)
        };

        let piece_range = self.layout.piece_range(index);
        let request_begin = piece_range.start + offset as u64;
        let request_end = (request_begin + length as u64).min(piece_range.end);
        let Some((begin, end)) = window.clip(request_begin, request_end) else {
            return Ok(Some(Bytes::new()));
        };

        if let Some(piece) = pending {
            let from = (begin - piece_range.start) as usize;
            let to = (end - piece_range.start) as usize;
            return Ok(Some(piece.data.slice(from..to)));
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(StoreError::NotOpen)?;
        let data = read_at(file, begin - window.begin_pos, (end - begin) as usize).await?;
        Ok(Some(Bytes::from(data)))
    }

    /// Writes out pending pieces and closes the file. Later puts fail with
    /// [`StoreError::NotOpen`].
    pub async fn release(&self) -> Result<(), StoreError> {
        let (window, batch) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.buffered = 0;
            let batch: Vec<Piece> = state.pending.drain(..).collect();
            (state.window.clone(), batch)
        };

        if let Some(window) = &window {
            self.write(window, batch).await?;
        }

        if let Some(file) = self.file.lock().await.take() {
            file.sync_all().await?;
            info!(path = ?window.map(|w| w.path), "piece store released");
        }
        Ok(())
    }

    async fn write(&self, window: &FileWindow, batch: Vec<Piece>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(StoreError::NotOpen)?;

        for piece in &batch {
            let range = self.layout.piece_range(piece.index);
            let Some((begin, end)) = window.clip(range.start, range.end) else {
                continue;
            };
            let chunk = &piece.data[(begin - range.start) as usize..(end - range.start) as usize];
            file.seek(SeekFrom::Start(begin - window.begin_pos)).await?;
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        debug!(path = %window.path.display(), pieces = batch.len(), "pieces written");
        Ok(())
    }

    /// Bytes of the piece that fall inside this file.
    fn overlap(&self, window: &FileWindow, index: u32) -> u64 {
        if !window.owns(index) {
            return 0;
        }
        let range = self.layout.piece_range(index);
        window
            .clip(range.start, range.end)
            .map_or(0, |(begin, end)| end - begin)
    }

    /// Inclusive range of piece indices owned by this store.
    pub fn span(&self) -> Option<(u32, u32)> {
        self.state.lock().window.as_ref().and_then(|w| w.span)
    }

    pub fn owns(&self, index: u32) -> bool {
        self.state.lock().window.as_ref().is_some_and(|w| w.owns(index))
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().window.as_ref().map(|w| w.path.clone())
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.state.lock().pieces.has(index as usize)
    }

    /// Bytes of this file covered by downloaded pieces.
    pub fn downloaded(&self) -> u64 {
        self.state.lock().downloaded
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state
            .window
            .as_ref()
            .is_some_and(|w| state.downloaded == w.length())
    }

    pub fn pieces(&self) -> Bitfield {
        self.state.lock().pieces.clone()
    }

    pub fn bad_pieces(&self) -> Bitfield {
        self.state.lock().bad_pieces.clone()
    }

    pub fn downloading_pieces(&self) -> Bitfield {
        self.state.lock().downloading.clone()
    }

    /// Bytes accepted by `put` but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending.iter().map(Piece::len).sum()
    }
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PieceStore")
            .field("window", &state.window)
            .field("pieces", &state.pieces.count())
            .field("downloaded", &state.downloaded)
            .finish()
    }
}

/// Reads up to `len` bytes at `pos`. Bytes past the end of the file read as
/// zero.
async fn read_at(file: &mut File, pos: u64, len: usize) -> Result<Vec<u8>, StoreError> {
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(pos)).await?;
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(buf)
}

fn has_data(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| b != 0)
}
