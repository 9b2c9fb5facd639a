use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tracing::debug;

use crate::peer::PeerSession;

/// A connection the optimizer can score and evict.
pub trait PoolMember: Send + Sync + 'static {
    fn session(&self) -> &Arc<PeerSession>;

    fn is_available(&self) -> bool;

    /// Returns whether the member was scored before, marking it scored.
    fn marked(&self) -> bool;

    /// Bytes uploaded since the previous call.
    fn upload_mark(&self) -> u64;

    /// Bytes downloaded since the previous call.
    fn download_mark(&self) -> u64;

    fn release(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

/// How a pool scores its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Inbound connections, scored by what we upload to them.
    Upload,
    /// Outbound connections, scored by traffic in either direction.
    Mixed,
}

/// Why the optimizer kept or dropped a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Unavailable,
    DownloadSource,
    Unscored,
    Productive,
    Idle,
    OverCapacity,
}

impl Verdict {
    fn keeps(self) -> bool {
        matches!(
            self,
            Verdict::DownloadSource | Verdict::Unscored | Verdict::Productive
        )
    }
}

/// A bounded set of connections with a tit-for-tat style optimizer.
///
/// Admission is refused once the pool holds `max_peers` members, except for
/// peers that are currently a download source. [`SwarmPool::optimize`] drains
/// the pool in admission order and re-admits only members that are still
/// earning their slot.
///
/// # Examples
///
/// ```no_run
/// use swarmcore::peer::PeerConnection;
/// use swarmcore::swarm::{PoolKind, SwarmPool};
///
/// # async fn example(conn: std::sync::Arc<PeerConnection>) {
/// let pool: SwarmPool<PeerConnection> = SwarmPool::new(PoolKind::Mixed, 20);
/// if let Err(conn) = pool.admit(conn) {
///     conn.release().await;
/// }
/// let evicted = pool.optimize();
/// # }
/// ```
pub struct SwarmPool<C> {
    kind: PoolKind,
    max_peers: AtomicUsize,
    members: Mutex<VecDeque<Arc<C>>>,
}

impl<C: PoolMember> SwarmPool<C> {
    pub fn new(kind: PoolKind, max_peers: usize) -> Self {
        Self {
            kind,
            max_peers: AtomicUsize::new(max_peers),
            members: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers.load(Ordering::Relaxed)
    }

    pub fn set_max_peers(&self, max_peers: usize) {
        self.max_peers.store(max_peers, Ordering::Relaxed);
    }

    pub fn can_admit(&self, session: &PeerSession) -> bool {
        session.is_downloading() || self.members.lock().len() < self.max_peers()
    }

    /// Adds a connection, handing it back if the pool is full.
    pub fn admit(&self, conn: Arc<C>) -> Result<(), Arc<C>> {
        let mut members = self.members.lock();
        if !conn.session().is_downloading() && members.len() >= self.max_peers() {
            debug!(peer = %conn.session().addr(), pool = ?self.kind, "pool full");
            return Err(conn);
        }
        members.push_back(conn);
        Ok(())
    }

    /// Runs one optimizer pass and returns the members it dropped.
    ///
    /// Dropped members that are still available are released in the
    /// background. Must be called within a tokio runtime.
    pub fn optimize(&self) -> Vec<Arc<C>> {
        let max_peers = self.max_peers();
        let mut members = self.members.lock();
        let drained = std::mem::take(&mut *members);
        let mut dropped = Vec::new();

        for conn in drained {
            let verdict = self.judge(&conn, members.len(), max_peers);
            debug!(peer = %conn.session().addr(), pool = ?self.kind, ?verdict, "optimize");
            if verdict.keeps() {
                members.push_back(conn);
                continue;
            }
            if verdict != Verdict::Unavailable {
                tokio::spawn(conn.clone().release());
            }
            dropped.push(conn);
        }
        dropped
    }

    fn judge(&self, conn: &Arc<C>, kept: usize, max_peers: usize) -> Verdict {
        // Sample every mark so the next pass measures a fresh interval.
        let scored = conn.marked();
        let upload = conn.upload_mark();
        let download = conn.download_mark();

        if !conn.is_available() {
            return Verdict::Unavailable;
        }
        if conn.session().is_downloading() {
            return Verdict::DownloadSource;
        }
        if !scored {
            return if kept < max_peers {
                Verdict::Unscored
            } else {
                Verdict::OverCapacity
            };
        }

        let score = match self.kind {
            PoolKind::Upload => upload,
            PoolKind::Mixed => upload.saturating_add(download),
        };
        // A productive member only loses its slot once the pool is already
        // past its cap.
        if score == 0 {
            Verdict::Idle
        } else if kept > max_peers {
            Verdict::OverCapacity
        } else {
            Verdict::Productive
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.find(addr).is_some()
    }

    pub fn find(&self, addr: SocketAddr) -> Option<Arc<C>> {
        self.members
            .lock()
            .iter()
            .find(|c| c.session().addr() == addr)
            .cloned()
    }

    /// Members in admission order.
    pub fn snapshot(&self) -> Vec<Arc<C>> {
        self.members.lock().iter().cloned().collect()
    }

    /// Removes every member and releases them, waiting for all to finish.
    pub async fn release_all(&self) {
        let members: Vec<_> = self.members.lock().drain(..).collect();
        join_all(members.into_iter().map(PoolMember::release)).await;
    }
}

impl<C> std::fmt::Debug for SwarmPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmPool")
            .field("kind", &self.kind)
            .field("members", &self.members.lock().len())
            .field("max_peers", &self.max_peers.load(Ordering::Relaxed))
            .finish()
    }
}
