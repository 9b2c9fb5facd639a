use std::net::SocketAddr;

use thiserror::Error;

use crate::peer::PeerError;
use crate::storage::StoreError;

/// Errors raised while managing a torrent's swarm.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An inbound connection arrived while the upload pool was full.
    #[error("connection from {0} rejected")]
    Rejected(SocketAddr),

    /// No registered peer can be connected to.
    #[error("no connectable peers")]
    PeerExhausted,

    /// The torrent session was released.
    #[error("torrent released")]
    Released,
}
