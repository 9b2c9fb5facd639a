//! One torrent's swarm: its stores, known peers and connection pools.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::bandwidth::BandwidthLimiter;
use crate::config::SwarmConfig;
use crate::constants::HAVE_CHANNEL_CAPACITY;
use crate::peer::{
    handshake, ConnectionRole, PeerConnection, PeerError, PeerId, PeerSession, PeerSource, PeerTransport,
};
use crate::stats::Statistics;
use crate::storage::{StoreError, StoreGroup, TorrentLayout};
use crate::swarm::{PeerRegistry, PoolKind, SwarmError, SwarmPool};
use crate::task::TorrentContext;

/// The swarm engine for one torrent.
///
/// Discovery pushes addresses in with [`TorrentSession::add_peer`]; the
/// owner then calls [`TorrentSession::connect_peers`] to fill the launcher
/// pool, hands inbound streams to [`TorrentSession::accept`], and runs
/// [`TorrentSession::optimize`] on a timer.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use swarmcore::peer::PeerSource;
/// use swarmcore::{SwarmConfig, TorrentLayout, TorrentSession};
///
/// # async fn example(layout: Arc<TorrentLayout>) -> Result<(), swarmcore::SwarmError> {
/// let session = TorrentSession::open(layout, Path::new("downloads"), None, SwarmConfig::default()).await?;
/// session.add_peer("192.0.2.7:6881".parse().unwrap(), PeerSource::Tracker);
/// session.connect_peers().await?;
///
/// while !session.is_complete() {
///     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
///     session.optimize().await?;
/// }
/// session.release().await?;
/// # Ok(())
/// # }
/// ```
pub struct TorrentSession {
    ctx: TorrentContext,
    registry: PeerRegistry,
    launchers: SwarmPool<PeerConnection>,
    uploaders: SwarmPool<PeerConnection>,
    released: AtomicBool,
}

impl TorrentSession {
    /// Opens the torrent's stores under `base`. `selection` limits the
    /// download to some files, as for [`StoreGroup::open`].
    pub async fn open(
        layout: Arc<TorrentLayout>,
        base: &Path,
        selection: Option<&[usize]>,
        config: SwarmConfig,
    ) -> Result<Self, SwarmError> {
        let limiter = Arc::new(BandwidthLimiter::new(config.download_limit, config.upload_limit));
        let statistics = Arc::new(Statistics::new().with_limiter(limiter));
        let group = StoreGroup::open(layout, base, selection, config.store_options()).await?;
        let config = Arc::new(config);

        let ctx = TorrentContext::new(
            Arc::new(group),
            config.clone(),
            statistics.clone(),
            PeerId::generate(),
            HAVE_CHANNEL_CAPACITY,
        );
        let registry = PeerRegistry::new(ctx.piece_count(), statistics, config.max_fail_times);

        info!(
            info_hash = ?ctx.info_hash(),
            pieces = ctx.piece_count(),
            have = ctx.group.pieces().count(),
            "torrent session opened"
        );
        Ok(Self {
            launchers: SwarmPool::new(PoolKind::Mixed, config.max_peers),
            uploaders: SwarmPool::new(PoolKind::Upload, config.max_peers),
            ctx,
            registry,
            released: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &TorrentContext {
        &self.ctx
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.peer_id
    }

    pub fn group(&self) -> &Arc<StoreGroup> {
        &self.ctx.group
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn launchers(&self) -> &SwarmPool<PeerConnection> {
        &self.launchers
    }

    pub fn uploaders(&self) -> &SwarmPool<PeerConnection> {
        &self.uploaders
    }

    /// Registers a discovered peer.
    pub fn add_peer(&self, addr: SocketAddr, source: PeerSource) -> Arc<PeerSession> {
        self.registry.add(addr, source)
    }

    /// Connects to registered peers until the launcher pool is full.
    ///
    /// Returns the number of new connections, or
    /// [`SwarmError::PeerExhausted`] if the pool has room but no peer can
    /// be tried.
    pub async fn connect_peers(&self) -> Result<usize, SwarmError> {
        self.ensure_open()?;
        if !self.ctx.task.is_downloadable() || self.ctx.group.is_complete() {
            return Ok(0);
        }

        let room = self.launchers.max_peers().saturating_sub(self.launchers.len());
        let candidates: Vec<_> = std::iter::from_fn(|| self.registry.pick())
            .take(room)
            .collect();
        if candidates.is_empty() {
            return if room == 0 {
                Ok(0)
            } else {
                Err(SwarmError::PeerExhausted)
            };
        }

        let attempts = candidates.into_iter().map(|session| {
            let ctx = self.ctx.clone();
            async move { (session.clone(), PeerConnection::connect(ctx, session).await) }
        });

        let mut connected = 0;
        for (session, result) in join_all(attempts).await {
            match result {
                Ok(conn) => match self.launchers.admit(conn) {
                    Ok(()) => connected += 1,
                    Err(conn) => {
                        conn.release().await;
                        self.registry.inferior(&session);
                    }
                },
                Err(_) => {
                    session.unclaim();
                    self.registry.inferior(&session);
                }
            }
        }
        debug!(connected, launchers = self.launchers.len(), "peers connected");
        Ok(connected)
    }

    /// Handshakes an inbound stream and admits it to the upload pool.
    pub async fn accept<S>(&self, stream: S, addr: SocketAddr) -> Result<Arc<PeerConnection>, SwarmError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.ensure_open()?;
        let session = self.registry.add(addr, PeerSource::Connect);
        if !self.uploaders.can_admit(&session) || !session.claim() {
            debug!(peer = %addr, "inbound connection rejected");
            return Err(SwarmError::Rejected(addr));
        }

        let mut transport = PeerTransport::new(stream);
        let exchanged = timeout(
            self.ctx.config.handshake_timeout,
            handshake(
                &mut transport,
                *self.ctx.info_hash(),
                self.ctx.peer_id,
                ConnectionRole::Uploader,
            ),
        )
        .await
        .unwrap_or(Err(PeerError::Timeout));
        let remote = match exchanged {
            Ok(remote) => remote,
            Err(e) => {
                session.fail();
                session.unclaim();
                return Err(e.into());
            }
        };

        let (conn, outbound) = PeerConnection::new(self.ctx.clone(), session, ConnectionRole::Uploader);
        if let Err(conn) = self.uploaders.admit(conn.clone()) {
            conn.release().await;
            return Err(SwarmError::Rejected(addr));
        }
        conn.start(transport, remote, outbound);
        Ok(conn)
    }

    /// Runs the optimizer on both pools, re-queues evicted launcher peers
    /// and refills the launcher pool. Returns the number of new connections.
    pub async fn optimize(&self) -> Result<usize, SwarmError> {
        self.ensure_open()?;
        for conn in self.launchers.optimize() {
            self.registry.inferior(conn.session());
        }
        // Inbound addresses use ephemeral ports and are not worth dialing.
        self.uploaders.optimize();
        match self.connect_peers().await {
            Err(SwarmError::PeerExhausted) => Ok(0),
            other => other,
        }
    }

    /// Sessions of live connections currently exchanging data, for
    /// peer-exchange payloads.
    pub fn useful_peers(&self) -> Vec<Arc<PeerSession>> {
        self.launchers
            .snapshot()
            .into_iter()
            .chain(self.uploaders.snapshot())
            .filter(|conn| conn.is_available())
            .map(|conn| conn.session().clone())
            .filter(|session| session.is_downloading() || session.is_uploading())
            .collect()
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.ctx.statistics
    }

    /// The store failure that stopped the torrent, if any.
    pub fn error(&self) -> Option<Arc<StoreError>> {
        self.ctx.task.error()
    }

    pub fn is_complete(&self) -> bool {
        self.ctx.group.is_complete()
    }

    /// Releases every connection, then flushes and closes the stores.
    pub async fn release(&self) -> Result<(), SwarmError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        futures::join!(self.launchers.release_all(), self.uploaders.release_all());
        self.ctx.group.release().await?;
        info!(
            downloaded = self.ctx.statistics.downloaded(),
            uploaded = self.ctx.statistics.uploaded(),
            "torrent session released"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SwarmError> {
        if self.released.load(Ordering::Acquire) {
            return Err(SwarmError::Released);
        }
        Ok(())
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("context", &self.ctx)
            .field("peers", &self.registry.len())
            .field("launchers", &self.launchers.len())
            .field("uploaders", &self.uploaders.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{sha1_digest, ResumeCheck};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const PIECE: u64 = 16384;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8 + 1).collect()
    }

    fn layout_for(data: &[u8]) -> Arc<TorrentLayout> {
        let hashes = data.chunks(PIECE as usize).map(sha1_digest).collect();
        let files = vec![
            (PathBuf::from("movie/part1.bin"), 30000),
            (PathBuf::from("movie/part2.bin"), data.len() as u64 - 30000),
        ];
        Arc::new(TorrentLayout::from_files([3u8; 20], PIECE, files, hashes).unwrap())
    }

    async fn seeded(dir: &Path, layout: Arc<TorrentLayout>, data: &[u8]) -> Arc<TorrentSession> {
        for entry in layout.files() {
            let path = dir.join(&entry.path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let start = entry.offset as usize;
            std::fs::write(path, &data[start..start + entry.length as usize]).unwrap();
        }
        let config = SwarmConfig::default().with_resume_check(ResumeCheck::Verify);
        Arc::new(TorrentSession::open(layout, dir, None, config).await.unwrap())
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_download_between_sessions_over_tcp() {
        let seed_dir = TempDir::new().unwrap();
        let leech_dir = TempDir::new().unwrap();
        let data = sample_data(70000);
        let layout = layout_for(&data);

        let seeder = seeded(seed_dir.path(), layout.clone(), &data).await;
        assert!(seeder.is_complete());
        let leecher = TorrentSession::open(layout, leech_dir.path(), None, SwarmConfig::default())
            .await
            .unwrap();
        assert!(!leecher.is_complete());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seeder_addr = listener.local_addr().unwrap();
        let accepting = seeder.clone();
        tokio::spawn(async move {
            while let Ok((stream, addr)) = listener.accept().await {
                let _ = accepting.accept(stream, addr).await;
            }
        });

        leecher.add_peer(seeder_addr, PeerSource::Tracker);
        assert_eq!(leecher.connect_peers().await.unwrap(), 1);
        assert_eq!(leecher.launchers().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(10);
        while !leecher.is_complete() {
            assert!(Instant::now() < deadline, "download did not finish");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seeder.uploaders().len(), 1);
        assert!(leecher.error().is_none());

        leecher.release().await.unwrap();
        assert_eq!(leecher.statistics().downloaded(), 70000);
        assert!(matches!(leecher.connect_peers().await, Err(SwarmError::Released)));

        let mut received = std::fs::read(leech_dir.path().join("movie/part1.bin")).unwrap();
        received.extend(std::fs::read(leech_dir.path().join("movie/part2.bin")).unwrap());
        assert_eq!(received, data);

        seeder.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_counted() {
        let temp = TempDir::new().unwrap();
        let data = sample_data(40000);
        let session = TorrentSession::open(layout_for(&data), temp.path(), None, SwarmConfig::default())
            .await
            .unwrap();

        assert!(matches!(
            session.connect_peers().await,
            Err(SwarmError::PeerExhausted)
        ));

        let peer = session.add_peer(unused_addr().await, PeerSource::Dht);
        assert_eq!(session.connect_peers().await.unwrap(), 0);
        assert_eq!(peer.fail_times(), 1);
        assert!(!peer.is_connected());
        assert_eq!(session.registry().queued(), 1);
        assert!(session.launchers().is_empty());
    }

    #[tokio::test]
    async fn test_accept_rejects_when_upload_pool_full() {
        let temp = TempDir::new().unwrap();
        let data = sample_data(40000);
        let config = SwarmConfig::default().with_max_peers(0);
        let session = TorrentSession::open(layout_for(&data), temp.path(), None, config)
            .await
            .unwrap();

        let (stream, _other) = tokio::io::duplex(1024);
        let addr: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        assert!(matches!(
            session.accept(stream, addr).await,
            Err(SwarmError::Rejected(rejected)) if rejected == addr
        ));
        assert!(session.registry().get(addr).unwrap().has_source(PeerSource::Connect));
    }

    #[tokio::test]
    async fn test_accept_rejects_wrong_torrent() {
        let temp = TempDir::new().unwrap();
        let data = sample_data(40000);
        let session = TorrentSession::open(layout_for(&data), temp.path(), None, SwarmConfig::default())
            .await
            .unwrap();

        let (stream, other) = tokio::io::duplex(1024);
        let addr: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        tokio::spawn(async move {
            let mut remote = PeerTransport::new(other);
            let _ = remote
                .send_handshake(&crate::peer::Handshake::new([8u8; 20], PeerId::generate()))
                .await;
        });

        assert!(matches!(
            session.accept(stream, addr).await,
            Err(SwarmError::Peer(PeerError::InfoHashMismatch))
        ));
        let peer = session.registry().get(addr).unwrap();
        assert_eq!(peer.fail_times(), 1);
        assert!(!peer.is_connected());
    }
}
