use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::error::StoreError;
use super::layout::TorrentLayout;
use super::piece::{Piece, PieceDescriptor};
use super::store::{PieceStore, SharedBitfield, StoreOptions};
use crate::peer::Bitfield;

/// The stores of one torrent, viewed as a single piece space.
///
/// Picking is serialized group-wide: once a store hands out a piece, every
/// other store owning that piece (a boundary piece) marks it as downloading
/// before the next pick can run, so a piece is never handed out twice.
pub struct StoreGroup {
    layout: Arc<TorrentLayout>,
    stores: Vec<PieceStore>,
    have: SharedBitfield,
    wanted: Bitfield,
    selected_length: u64,
    pick_lock: Mutex<()>,
}

impl StoreGroup {
    /// Opens a store for every selected file under `base`.
    ///
    /// `selection` holds indices into [`TorrentLayout::files`]; `None`
    /// selects everything. Unselected files are neither created nor
    /// downloaded, though boundary pieces they share with a selected file
    /// still are.
    pub async fn open(
        layout: Arc<TorrentLayout>,
        base: &Path,
        selection: Option<&[usize]>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let piece_count = layout.piece_count();
        let have: SharedBitfield = Arc::new(RwLock::new(Bitfield::new(piece_count)));
        let mut wanted = Bitfield::new(piece_count);
        let mut stores = Vec::new();
        let mut selected_length = 0;

        for (file_index, entry) in layout.files().iter().enumerate() {
            if selection.is_some_and(|s| !s.contains(&file_index)) {
                debug!(path = %entry.path.display(), "file not selected");
                continue;
            }
            let store = PieceStore::new(layout.clone(), have.clone(), options);
            store
                .open(base.join(&entry.path), entry.length, entry.offset)
                .await?;
            if let Some((first, last)) = entry.piece_span(layout.piece_length()) {
                for index in first..=last {
                    wanted.set(index as usize);
                }
            }
            selected_length += entry.length;
            stores.push(store);
        }

        info!(
            files = stores.len(),
            pieces = piece_count,
            resumed = have.read().count(),
            "store group opened"
        );
        Ok(Self {
            layout,
            stores,
            have,
            wanted,
            selected_length,
            pick_lock: Mutex::new(()),
        })
    }

    /// Picks a piece the peer has and no store has or is downloading.
    pub fn pick(&self, peer_pieces: &Bitfield) -> Option<PieceDescriptor> {
        let _guard = self.pick_lock.lock();
        for (i, store) in self.stores.iter().enumerate() {
            let Some((first, last)) = store.span() else {
                continue;
            };
            if !peer_pieces.any_in(first as usize, last as usize) {
                continue;
            }
            if let Some(descriptor) = store.pick(peer_pieces) {
                for (j, other) in self.stores.iter().enumerate() {
                    if j != i {
                        other.reserve(descriptor.index());
                    }
                }
                return Some(descriptor);
            }
        }
        None
    }

    /// Hands a verified piece to every store that owns part of it.
    ///
    /// All stores are attempted; the first failure is returned.
    pub async fn put(&self, piece: &Piece) -> Result<(), StoreError> {
        let mut result = Ok(());
        for store in &self.stores {
            if !store.owns(piece.index) {
                continue;
            }
            if let Err(e) = store.put(piece).await {
                warn!(piece = piece.index, error = %e, "store rejected piece");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Returns a failed piece to the pool in every store that owns it.
    pub fn undone(&self, index: u32) {
        for store in &self.stores {
            store.undone(index);
        }
    }

    /// Reads part of a downloaded piece, stitched across file boundaries.
    ///
    /// Returns `None` if the piece is not held or the range falls outside it.
    pub async fn read(&self, index: u32, offset: u32, length: u32) -> Result<Option<Bytes>, StoreError> {
        if !self.have_piece(index) {
            return Ok(None);
        }
        let piece_size = self.layout.piece_size(index);
        if offset as u64 + length as u64 > piece_size {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(length as usize);
        for store in &self.stores {
            if !store.owns(index) {
                continue;
            }
            if let Some(part) = store.read(index, length, offset, true).await? {
                buf.extend_from_slice(&part);
            }
        }

        if buf.len() != length as usize {
            debug!(piece = index, got = buf.len(), length, "partial read");
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    /// Flushes pending writes and closes every file.
    pub async fn release(&self) -> Result<(), StoreError> {
        let mut result = Ok(());
        for store in &self.stores {
            if let Err(e) = store.release().await {
                warn!(error = %e, "failed to release store");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn have_piece(&self, index: u32) -> bool {
        self.have.read().has(index as usize)
    }

    /// Snapshot of every piece held by at least one store.
    pub fn pieces(&self) -> Bitfield {
        self.have.read().clone()
    }

    /// Returns true if the remote holds a selected piece we lack.
    pub fn wants_any(&self, remote: &Bitfield) -> bool {
        let have = self.have.read();
        remote
            .iter_set()
            .any(|i| self.wanted.has(i) && !have.has(i))
    }

    pub fn wants(&self, index: u32) -> bool {
        self.wanted.has(index as usize) && !self.have_piece(index)
    }

    /// Bytes of selected files covered by downloaded pieces.
    pub fn downloaded(&self) -> u64 {
        self.stores.iter().map(PieceStore::downloaded).sum()
    }

    /// Total length of selected files.
    pub fn selected_length(&self) -> u64 {
        self.selected_length
    }

    pub fn is_complete(&self) -> bool {
        self.stores.iter().all(PieceStore::is_complete)
    }

    pub fn layout(&self) -> &Arc<TorrentLayout> {
        &self.layout
    }

    pub fn stores(&self) -> &[PieceStore] {
        &self.stores
    }

    pub fn piece_count(&self) -> usize {
        self.layout.piece_count()
    }
}

impl std::fmt::Debug for StoreGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGroup")
            .field("stores", &self.stores.len())
            .field("pieces", &self.have.read().count())
            .finish()
    }
}
