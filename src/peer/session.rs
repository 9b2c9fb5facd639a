use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::bitfield::Bitfield;
use super::capability::{Capabilities, Capability};
use super::choking::ChokingState;
use super::peer_id::PeerId;
use crate::stats::Statistics;

/// Where a peer address was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Pex,
    Dht,
    Lsd,
    /// The peer connected to us.
    Connect,
    Holepunch,
}

impl PeerSource {
    const ALL: [PeerSource; 6] = [
        PeerSource::Tracker,
        PeerSource::Pex,
        PeerSource::Dht,
        PeerSource::Lsd,
        PeerSource::Connect,
        PeerSource::Holepunch,
    ];

    fn flag(self) -> u8 {
        1 << (self as u8)
    }
}

/// Every source a peer was seen from.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSources(u8);

impl PeerSources {
    pub fn insert(&mut self, source: PeerSource) {
        self.0 |= source.flag();
    }

    pub fn contains(&self, source: PeerSource) -> bool {
        self.0 & source.flag() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PeerSource> + '_ {
        PeerSource::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl fmt::Debug for PeerSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

struct SessionState {
    peer_id: Option<PeerId>,
    flags: ChokingState,
    capabilities: Capabilities,
    pieces: Bitfield,
    bad_pieces: Bitfield,
    allowed_fast: Bitfield,
    granted_fast: Bitfield,
    suggested: Bitfield,
    sources: PeerSources,
    dht_port: Option<u16>,
}

/// What we know about one remote peer of a torrent.
///
/// A session outlives its connections: it is created the first time an
/// address is seen and is handed to at most one [`PeerConnection`] at a
/// time. Failures accumulate across connections.
///
/// [`PeerConnection`]: super::PeerConnection
pub struct PeerSession {
    addr: SocketAddr,
    statistics: Statistics,
    fail_times: AtomicU32,
    connected: AtomicBool,
    downloading: AtomicBool,
    uploading: AtomicBool,
    state: Mutex<SessionState>,
}

impl PeerSession {
    /// `parent` receives every byte recorded against this peer.
    pub fn new(addr: SocketAddr, piece_count: usize, parent: Arc<Statistics>) -> Self {
        Self {
            addr,
            statistics: Statistics::with_parent(parent),
            fail_times: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            downloading: AtomicBool::new(false),
            uploading: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                peer_id: None,
                flags: ChokingState::default(),
                capabilities: Capabilities::empty(),
                pieces: Bitfield::new(piece_count),
                bad_pieces: Bitfield::new(piece_count),
                allowed_fast: Bitfield::new(piece_count),
                granted_fast: Bitfield::new(piece_count),
                suggested: Bitfield::new(piece_count),
                sources: PeerSources::default(),
                dht_port: None,
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    // Identity

    pub fn peer_id(&self) -> Option<PeerId> {
        self.state.lock().peer_id
    }

    pub fn set_peer_id(&self, peer_id: PeerId) {
        self.state.lock().peer_id = Some(peer_id);
    }

    /// Client tag from the peer ID, e.g. `UT3500`.
    pub fn client_name(&self) -> Option<String> {
        self.peer_id()
            .and_then(|id| id.client_id().map(str::to_owned))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.state.lock().capabilities = capabilities;
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.state.lock().capabilities.contains(capability)
    }

    pub fn add_source(&self, source: PeerSource) {
        self.state.lock().sources.insert(source);
    }

    pub fn has_source(&self, source: PeerSource) -> bool {
        self.state.lock().sources.contains(source)
    }

    pub fn sources(&self) -> PeerSources {
        self.state.lock().sources
    }

    pub fn dht_port(&self) -> Option<u16> {
        self.state.lock().dht_port
    }

    pub fn set_dht_port(&self, port: u16) {
        self.state.lock().dht_port = Some(port);
    }

    // Choke and interest

    pub fn flags(&self) -> ChokingState {
        self.state.lock().flags
    }

    pub fn set_am_choking(&self, choking: bool) {
        self.state.lock().flags.am_choking = choking;
    }

    pub fn set_am_interested(&self, interested: bool) {
        self.state.lock().flags.am_interested = interested;
    }

    pub fn set_peer_choking(&self, choking: bool) {
        self.state.lock().flags.peer_choking = choking;
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.state.lock().flags.peer_interested = interested;
    }

    /// Puts the flags back to their initial values for a new connection.
    pub fn reset_flags(&self) {
        self.state.lock().flags = ChokingState::default();
    }

    // Availability

    pub fn pieces(&self) -> Bitfield {
        self.state.lock().pieces.clone()
    }

    /// Adds every piece in `pieces` to the remote's availability.
    pub fn merge_pieces(&self, pieces: &Bitfield) {
        self.state.lock().pieces.union_with(pieces);
    }

    pub fn set_piece(&self, index: u32) {
        self.state.lock().pieces.set(index as usize);
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.state.lock().pieces.has(index as usize)
    }

    /// Remembers a piece that failed verification when downloaded from this
    /// peer; it is not requested from the peer again.
    pub fn mark_bad(&self, index: u32) {
        self.state.lock().bad_pieces.set(index as usize);
    }

    pub fn allow_fast(&self, index: u32) {
        self.state.lock().allowed_fast.set(index as usize);
    }

    /// Lets the remote request `index` from us while choked.
    pub fn grant_fast(&self, index: u32) {
        self.state.lock().granted_fast.set(index as usize);
    }

    pub fn is_granted_fast(&self, index: u32) -> bool {
        self.state.lock().granted_fast.has(index as usize)
    }

    pub fn suggest(&self, index: u32) {
        self.state.lock().suggested.set(index as usize);
    }

    /// Pieces the remote has, minus those that failed verification.
    pub fn available_pieces(&self) -> Bitfield {
        let state = self.state.lock();
        let mut pieces = state.pieces.clone();
        pieces.subtract(&state.bad_pieces);
        pieces
    }

    /// Pieces we may request while choked: allowed-fast and held by the
    /// remote.
    pub fn allowed_pieces(&self) -> Bitfield {
        let state = self.state.lock();
        let mut pieces = state.allowed_fast.clone();
        pieces.intersect_with(&state.pieces);
        pieces.subtract(&state.bad_pieces);
        pieces
    }

    /// Suggested pieces that are also available.
    pub fn suggested_pieces(&self) -> Bitfield {
        let state = self.state.lock();
        let mut pieces = state.suggested.clone();
        pieces.intersect_with(&state.pieces);
        pieces.subtract(&state.bad_pieces);
        pieces
    }

    // Status

    /// Counts a failed connection.
    pub fn fail(&self) -> u32 {
        self.fail_times.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn fail_times(&self) -> u32 {
        self.fail_times.load(Ordering::Relaxed)
    }

    /// Claims the session for a connection. Returns false if another
    /// connection already holds it.
    pub fn claim(&self) -> bool {
        !self.connected.swap(true, Ordering::AcqRel)
    }

    pub fn unclaim(&self) {
        self.connected.store(false, Ordering::Release);
        self.downloading.store(false, Ordering::Release);
        self.uploading.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The peer is currently a source of downloaded data.
    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::Acquire)
    }

    pub fn set_downloading(&self, downloading: bool) {
        self.downloading.store(downloading, Ordering::Release);
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::Acquire)
    }

    pub fn set_uploading(&self, uploading: bool) {
        self.uploading.store(uploading, Ordering::Release);
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("peer_id", &state.peer_id)
            .field("flags", &state.flags)
            .field("sources", &state.sources)
            .field("pieces", &state.pieces.count())
            .field("fail_times", &self.fail_times())
            .finish()
    }
}
