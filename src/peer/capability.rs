use std::fmt;

use crate::constants::RESERVED_LEN;

/// An optional protocol feature announced in the handshake's reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// DHT port exchange (BEP-5).
    Dht,
    /// Extension protocol (BEP-10).
    Extension,
    /// Fast extension (BEP-6).
    Fast,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Dht, Capability::Extension, Capability::Fast];

    /// Byte index and mask of the reserved bit carrying this capability.
    fn reserved_bit(self) -> (usize, u8) {
        match self {
            Capability::Dht => (7, 0x01),
            Capability::Fast => (7, 0x04),
            Capability::Extension => (5, 0x10),
        }
    }

    fn flag(self) -> u8 {
        match self {
            Capability::Dht => 1,
            Capability::Extension => 1 << 1,
            Capability::Fast => 1 << 2,
        }
    }
}

/// The set of capabilities a side of a connection supports.
///
/// # Examples
///
/// ```
/// use swarmcore::peer::{Capabilities, Capability};
///
/// let ours = Capabilities::empty().with(Capability::Fast).with(Capability::Extension);
/// let reserved = ours.to_reserved();
/// assert_eq!(reserved[7] & 0x04, 0x04);
///
/// let parsed = Capabilities::from_reserved(&reserved);
/// assert!(parsed.contains(Capability::Fast));
/// assert!(!parsed.contains(Capability::Dht));
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub fn empty() -> Self {
        Self(0)
    }

    /// Everything this crate implements.
    pub fn all() -> Self {
        Capability::ALL.into_iter().fold(Self::empty(), Self::with)
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.flag();
    }

    pub fn remove(&mut self, capability: Capability) {
        self.0 &= !capability.flag();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.flag() != 0
    }

    /// Capabilities both sides support.
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        Self(self.0 & other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Parses the reserved handshake bytes. Unknown bits are ignored.
    pub fn from_reserved(reserved: &[u8; RESERVED_LEN]) -> Self {
        Capability::ALL
            .into_iter()
            .filter(|c| {
                let (byte, mask) = c.reserved_bit();
                reserved[byte] & mask != 0
            })
            .fold(Self::empty(), Self::with)
    }

    pub fn to_reserved(&self) -> [u8; RESERVED_LEN] {
        let mut reserved = [0u8; RESERVED_LEN];
        for capability in self.iter() {
            let (byte, mask) = capability.reserved_bit();
            reserved[byte] |= mask;
        }
        reserved
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
