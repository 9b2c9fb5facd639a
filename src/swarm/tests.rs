use super::*;
use crate::peer::{PeerSession, PeerSource};
use crate::stats::Statistics;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct FakeConn {
    session: Arc<PeerSession>,
    available: AtomicBool,
    marked: AtomicBool,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    released: AtomicBool,
}

impl FakeConn {
    fn new(port: u16) -> Arc<Self> {
        let addr: SocketAddr = format!("10.0.0.1:{port}").parse().unwrap();
        Arc::new(Self {
            session: Arc::new(PeerSession::new(addr, 4, Arc::new(Statistics::new()))),
            available: AtomicBool::new(true),
            marked: AtomicBool::new(false),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            released: AtomicBool::new(false),
        })
    }

    fn scored(port: u16) -> Arc<Self> {
        let conn = Self::new(port);
        conn.marked.store(true, Ordering::SeqCst);
        conn
    }

    fn port(&self) -> u16 {
        self.session.addr().port()
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl PoolMember for FakeConn {
    fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn marked(&self) -> bool {
        self.marked.swap(true, Ordering::SeqCst)
    }

    fn upload_mark(&self) -> u64 {
        self.uploaded.swap(0, Ordering::SeqCst)
    }

    fn download_mark(&self) -> u64 {
        self.downloaded.swap(0, Ordering::SeqCst)
    }

    fn release(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.available.store(false, Ordering::SeqCst);
            self.released.store(true, Ordering::SeqCst);
        })
    }
}

fn ports(conns: &[Arc<FakeConn>]) -> Vec<u16> {
    conns.iter().map(|c| c.port()).collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_optimize_enforces_cap_in_admission_order() {
    let pool = SwarmPool::new(PoolKind::Mixed, 5);
    let conns: Vec<_> = (1..=5).map(FakeConn::new).collect();
    for conn in &conns {
        pool.admit(conn.clone()).unwrap();
    }

    pool.set_max_peers(3);
    let dropped = pool.optimize();
    settle().await;

    assert_eq!(ports(&dropped), vec![4, 5]);
    assert_eq!(ports(&pool.snapshot()), vec![1, 2, 3]);
    assert!(dropped.iter().all(|c| c.is_released()));
    assert!(pool.snapshot().iter().all(|c| !c.is_released()));
}

#[tokio::test]
async fn test_optimize_drops_idle_scored_members() {
    let pool = SwarmPool::new(PoolKind::Mixed, 3);
    let conns: Vec<_> = (1..=3).map(FakeConn::new).collect();
    for conn in &conns {
        pool.admit(conn.clone()).unwrap();
    }

    // the first pass only marks
    assert!(pool.optimize().is_empty());

    conns[0].uploaded.store(100, Ordering::SeqCst);
    conns[2].downloaded.store(100, Ordering::SeqCst);
    let dropped = pool.optimize();
    settle().await;

    assert_eq!(ports(&dropped), vec![2]);
    assert_eq!(ports(&pool.snapshot()), vec![1, 3]);
    assert!(conns[1].is_released());
}

#[tokio::test]
async fn test_download_source_is_never_released() {
    let pool = SwarmPool::new(PoolKind::Mixed, 3);
    let conns: Vec<_> = (1..=3).map(FakeConn::scored).collect();
    for conn in &conns {
        pool.admit(conn.clone()).unwrap();
    }
    conns[1].session.set_downloading(true);

    let dropped = pool.optimize();
    settle().await;

    assert_eq!(ports(&dropped), vec![1, 3]);
    assert_eq!(ports(&pool.snapshot()), vec![2]);
    assert!(!conns[1].is_released());

    // and is kept even when the cap is zero
    pool.set_max_peers(0);
    assert!(pool.optimize().is_empty());
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_upload_pool_ignores_download_traffic() {
    let pool = SwarmPool::new(PoolKind::Upload, 4);
    let uploader = FakeConn::scored(1);
    let downloader = FakeConn::scored(2);
    uploader.uploaded.store(10, Ordering::SeqCst);
    downloader.downloaded.store(10, Ordering::SeqCst);
    pool.admit(uploader).unwrap();
    pool.admit(downloader).unwrap();

    let dropped = pool.optimize();
    assert_eq!(ports(&dropped), vec![2]);
    assert_eq!(ports(&pool.snapshot()), vec![1]);
}

#[tokio::test]
async fn test_productive_members_over_cap_are_dropped() {
    let pool = SwarmPool::new(PoolKind::Mixed, 4);
    let conns: Vec<_> = (1..=4).map(FakeConn::scored).collect();
    for conn in &conns {
        conn.uploaded.store(1, Ordering::SeqCst);
        pool.admit(conn.clone()).unwrap();
    }

    pool.set_max_peers(2);
    let dropped = pool.optimize();
    assert_eq!(ports(&dropped), vec![4]);
    assert_eq!(ports(&pool.snapshot()), vec![1, 2, 3]);

    // once the pool is past its cap, fresh members lose their slot first
    let fresh = FakeConn::new(5);
    fresh.session.set_downloading(true);
    pool.admit(fresh.clone()).unwrap();
    fresh.session.set_downloading(false);
    for conn in &conns[..3] {
        conn.uploaded.store(1, Ordering::SeqCst);
    }
    let dropped = pool.optimize();
    assert_eq!(ports(&dropped), vec![5]);
    assert_eq!(ports(&pool.snapshot()), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unavailable_members_are_dropped_without_release() {
    let pool = SwarmPool::new(PoolKind::Mixed, 4);
    let conn = FakeConn::new(1);
    pool.admit(conn.clone()).unwrap();
    conn.available.store(false, Ordering::SeqCst);

    let dropped = pool.optimize();
    settle().await;
    assert_eq!(ports(&dropped), vec![1]);
    assert!(pool.is_empty());
    assert!(!conn.is_released());
}

#[tokio::test]
async fn test_admission_cap() {
    let pool = SwarmPool::new(PoolKind::Upload, 2);
    pool.admit(FakeConn::new(1)).unwrap();
    pool.admit(FakeConn::new(2)).unwrap();

    let refused = FakeConn::new(3);
    assert!(!pool.can_admit(&refused.session));
    let returned = pool.admit(refused).unwrap_err();
    assert_eq!(returned.port(), 3);

    let source = FakeConn::new(4);
    source.session.set_downloading(true);
    assert!(pool.can_admit(&source.session));
    pool.admit(source).unwrap();
    assert_eq!(pool.len(), 3);
    assert!(pool.contains("10.0.0.1:4".parse().unwrap()));
}

#[tokio::test]
async fn test_release_all() {
    let pool = SwarmPool::new(PoolKind::Mixed, 4);
    let conns: Vec<_> = (1..=3).map(FakeConn::new).collect();
    for conn in &conns {
        pool.admit(conn.clone()).unwrap();
    }
    pool.release_all().await;
    assert!(pool.is_empty());
    assert!(conns.iter().all(|c| c.is_released()));
}

fn registry(max_fail_times: u32) -> PeerRegistry {
    PeerRegistry::new(4, Arc::new(Statistics::new()), max_fail_times)
}

fn addr(port: u16) -> SocketAddr {
    format!("10.0.0.2:{port}").parse().unwrap()
}

#[test]
fn test_registry_deduplicates_and_merges_sources() {
    let registry = registry(3);
    let first = registry.add(addr(1), PeerSource::Tracker);
    let second = registry.add(addr(1), PeerSource::Dht);

    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.has_source(PeerSource::Tracker));
    assert!(first.has_source(PeerSource::Dht));
    assert!(!first.has_source(PeerSource::Pex));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.queued(), 1);
}

#[test]
fn test_registry_picks_newest_first_and_inferior_last() {
    let registry = registry(3);
    registry.add(addr(1), PeerSource::Tracker);
    registry.add(addr(2), PeerSource::Tracker);
    registry.add(addr(3), PeerSource::Pex);

    let picked = registry.pick().unwrap();
    assert_eq!(picked.addr(), addr(3));
    assert!(picked.is_connected());

    // evicted: back of the line
    picked.unclaim();
    registry.inferior(&picked);

    let order: Vec<_> = std::iter::from_fn(|| registry.pick())
        .map(|s| s.addr().port())
        .collect();
    assert_eq!(order, vec![2, 1, 3]);
    assert!(registry.pick().is_none());
}

#[test]
fn test_registry_skips_failed_and_connected_peers() {
    let registry = registry(2);
    let failing = registry.add(addr(1), PeerSource::Tracker);
    let busy = registry.add(addr(2), PeerSource::Tracker);
    registry.add(addr(3), PeerSource::Tracker);

    failing.fail();
    failing.fail();
    assert!(busy.claim());

    assert_eq!(registry.pick().unwrap().addr(), addr(3));
    assert!(registry.pick().is_none());
    // the busy peer waits for its connection to end
    assert_eq!(registry.queued(), 1);
    busy.unclaim();
    assert_eq!(registry.pick().unwrap().addr(), addr(2));

    // inbound peers are known but not queued
    registry.add(addr(4), PeerSource::Connect);
    assert!(registry.pick().is_none());
    assert_eq!(registry.len(), 4);
}
