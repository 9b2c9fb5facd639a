//! State shared by every connection of one torrent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::SwarmConfig;
use crate::peer::PeerId;
use crate::stats::Statistics;
use crate::storage::{StoreError, StoreGroup, TorrentLayout};

/// Whether a torrent may still download and upload, and the store error
/// that stopped it, if any.
#[derive(Debug)]
pub struct TaskState {
    downloadable: AtomicBool,
    uploadable: AtomicBool,
    error: Mutex<Option<Arc<StoreError>>>,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            downloadable: AtomicBool::new(true),
            uploadable: AtomicBool::new(true),
            error: Mutex::new(None),
        }
    }

    pub fn is_downloadable(&self) -> bool {
        self.downloadable.load(Ordering::Acquire)
    }

    pub fn is_uploadable(&self) -> bool {
        self.uploadable.load(Ordering::Acquire)
    }

    pub fn set_downloadable(&self, downloadable: bool) {
        self.downloadable.store(downloadable, Ordering::Release);
    }

    pub fn set_uploadable(&self, uploadable: bool) {
        self.uploadable.store(uploadable, Ordering::Release);
    }

    /// Records a store failure and stops the task. Only the first error is
    /// kept.
    pub fn fail(&self, err: StoreError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            error!(error = %err, "store failure, stopping task");
            *slot = Some(Arc::new(err));
        }
        self.downloadable.store(false, Ordering::Release);
        self.uploadable.store(false, Ordering::Release);
    }

    pub fn error(&self) -> Option<Arc<StoreError>> {
        self.error.lock().clone()
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles a connection needs to take part in a torrent.
#[derive(Clone)]
pub struct TorrentContext {
    pub layout: Arc<TorrentLayout>,
    pub group: Arc<StoreGroup>,
    pub config: Arc<SwarmConfig>,
    pub task: Arc<TaskState>,
    pub statistics: Arc<Statistics>,
    pub peer_id: PeerId,
    have_tx: broadcast::Sender<u32>,
}

impl TorrentContext {
    pub fn new(
        group: Arc<StoreGroup>,
        config: Arc<SwarmConfig>,
        statistics: Arc<Statistics>,
        peer_id: PeerId,
        have_capacity: usize,
    ) -> Self {
        let (have_tx, _) = broadcast::channel(have_capacity.max(1));
        Self {
            layout: group.layout().clone(),
            group,
            config,
            task: Arc::new(TaskState::new()),
            statistics,
            peer_id,
            have_tx,
        }
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        self.layout.info_hash()
    }

    pub fn piece_count(&self) -> usize {
        self.layout.piece_count()
    }

    /// Subscribes to completed piece indices.
    pub fn subscribe_have(&self) -> broadcast::Receiver<u32> {
        self.have_tx.subscribe()
    }

    /// Announces a completed piece to every connection.
    pub(crate) fn announce_have(&self, index: u32) {
        if self.task.is_uploadable() {
            // No receivers simply means no live connections.
            let _ = self.have_tx.send(index);
        }
        if self.group.is_complete() {
            info!(downloaded = self.group.downloaded(), "torrent complete");
        }
    }
}

impl std::fmt::Debug for TorrentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentContext")
            .field("info_hash", &self.layout.info_hash())
            .field("peer_id", &self.peer_id)
            .finish()
    }
}
