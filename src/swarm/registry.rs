use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::peer::{PeerSession, PeerSource};
use crate::stats::Statistics;

/// Every peer seen for a torrent, plus the queue of connection candidates.
///
/// Newly discovered peers go to the front of the queue and are tried
/// first. Evicted peers go to the back. Peers that failed too often are
/// never handed out again.
pub struct PeerRegistry {
    piece_count: usize,
    statistics: Arc<Statistics>,
    max_fail_times: u32,
    peers: DashMap<SocketAddr, Arc<PeerSession>>,
    queue: Mutex<VecDeque<SocketAddr>>,
}

impl PeerRegistry {
    /// Sessions created here record their traffic into `statistics`.
    pub fn new(piece_count: usize, statistics: Arc<Statistics>, max_fail_times: u32) -> Self {
        Self {
            piece_count,
            statistics,
            max_fail_times,
            peers: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers `addr` as seen from `source`, returning its session.
    pub fn add(&self, addr: SocketAddr, source: PeerSource) -> Arc<PeerSession> {
        let mut created = false;
        let session = self
            .peers
            .entry(addr)
            .or_insert_with(|| {
                created = true;
                Arc::new(PeerSession::new(
                    addr,
                    self.piece_count,
                    self.statistics.clone(),
                ))
            })
            .clone();
        session.add_source(source);

        // Inbound peers are connected already; they are queued once released.
        if created && source != PeerSource::Connect {
            trace!(peer = %addr, ?source, "peer discovered");
            self.queue.lock().push_front(addr);
        }
        session
    }

    /// Claims the most recently discovered usable peer.
    ///
    /// Peers still held by a connection stay queued for a later pick.
    pub fn pick(&self) -> Option<Arc<PeerSession>> {
        let mut queue = self.queue.lock();
        let mut busy = Vec::new();
        let mut picked = None;
        while let Some(addr) = queue.pop_front() {
            let Some(session) = self.get(addr) else {
                continue;
            };
            if session.fail_times() >= self.max_fail_times {
                trace!(peer = %addr, fails = session.fail_times(), "peer excluded");
                continue;
            }
            if session.claim() {
                picked = Some(session);
                break;
            }
            busy.push(addr);
        }
        queue.extend(busy);
        picked
    }

    /// Queues an evicted or failed peer behind every other candidate.
    pub fn inferior(&self, session: &PeerSession) {
        let addr = session.addr();
        let mut queue = self.queue.lock();
        if !queue.contains(&addr) {
            queue.push_back(addr);
        }
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<PeerSession>> {
        self.peers.get(&addr).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Candidates waiting to be connected.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers.len())
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}
