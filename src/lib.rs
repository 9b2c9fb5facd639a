//! swarmcore - the swarm engine of a BitTorrent client
//!
//! This library moves a torrent's pieces between disk and the peers of its
//! swarm. Discovery (trackers, DHT, peer exchange) and metainfo parsing
//! live outside; they feed addresses and a [`TorrentLayout`] in.
//!
//! # Modules
//!
//! - [`storage`] - Piece-indexed file stores, resume and write buffering
//! - [`peer`] - BEP-3/6 peer wire protocol and the per-peer connection state machine
//! - [`swarm`] - Connection pools, the optimizer and the peer registry
//! - [`session`] - [`TorrentSession`], tying one torrent together
//! - [`stats`] / [`bandwidth`] - Transfer counters and rate limiting
//! - [`config`] / [`constants`] - Tunables and protocol constants

pub mod bandwidth;
pub mod config;
pub mod constants;
pub mod peer;
pub mod session;
pub mod stats;
pub mod storage;
pub mod swarm;
pub mod task;

pub use bandwidth::{BandwidthLimiter, RateLimiter};
pub use config::SwarmConfig;
pub use peer::{
    Bitfield, Capabilities, Capability, ConnectionRole, Handshake, Message, PeerConnection,
    PeerError, PeerId, PeerSession, PeerSource,
};
pub use session::TorrentSession;
pub use stats::Statistics;
pub use storage::{
    FileEntry, Piece, PieceDescriptor, PieceStore, ResumeCheck, StoreError, StoreGroup,
    StoreOptions, TorrentLayout,
};
pub use swarm::{PeerRegistry, PoolKind, PoolMember, SwarmError, SwarmPool};
pub use task::{TaskState, TorrentContext};
