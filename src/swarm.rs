//! Connection pools and the peer registry.
//!
//! A torrent keeps two [`SwarmPool`]s: launcher connections we opened,
//! scored by traffic in both directions, and uploader connections the remote
//! opened, scored by what we upload. An external timer calls
//! [`SwarmPool::optimize`] to evict members that stopped earning their slot;
//! the [`PeerRegistry`] then supplies fresh candidates.

mod error;
mod pool;
mod registry;

pub use error::SwarmError;
pub use pool::{PoolKind, PoolMember, SwarmPool};
pub use registry::PeerRegistry;

#[cfg(test)]
mod tests;
