//! Peer wire protocol (BEP-3, BEP-5 port, BEP-6, BEP-10 reserved bit)
//!
//! A [`PeerSession`] holds what is known about one remote peer across
//! connections. A [`PeerConnection`] is one live session with it: it frames
//! messages over a [`PeerTransport`], tracks choke and interest, serves
//! requested slices and, when we launched it, downloads pieces into the
//! torrent's store group.

mod bitfield;
mod capability;
mod choking;
mod connection;
mod error;
mod message;
mod peer_id;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use capability::{Capabilities, Capability};
pub use choking::ChokingState;
pub use connection::{handshake, ConnectionRole, ConnectionState, PeerConnection};
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use session::{PeerSession, PeerSource, PeerSources};
pub use transport::{PeerReader, PeerTransport, PeerWriter};

#[cfg(test)]
mod tests;
