use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// A 20-byte peer identifier.
///
/// Generated IDs use the Azureus-style layout `-SW0001-<12 random bytes>`.
/// Remote IDs are kept as received; [`PeerId::client_id`] extracts the
/// client tag when the remote uses the same layout.
///
/// # Examples
///
/// ```
/// use swarmcore::peer::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_eq!(peer_id.as_bytes().len(), 20);
/// assert_eq!(peer_id.client_id(), Some("SW0001"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a random peer ID carrying this client's prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(&mut id[CLIENT_PREFIX.len()..]);
        Self(id)
    }

    /// Returns `None` unless the slice is exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The 6-character client tag of an Azureus-style ID, e.g. `UT3500`.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }

    /// Returns true if the ID was generated by this client.
    pub fn is_ours(&self) -> bool {
        self.0.starts_with(CLIENT_PREFIX)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({client})"),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|&byte| {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                write!(f, "{}", byte as char)
            } else {
                write!(f, "%{byte:02x}")
            }
        })
    }
}
