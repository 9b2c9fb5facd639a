use bytes::Bytes;

/// A bitfield representing which pieces are available.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte, matching the
/// `bitfield` wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0; byte_count],
            piece_count,
        }
    }

    /// Creates a bitfield from raw wire bytes.
    ///
    /// Short input is zero-padded, extra bytes are dropped and spare bits
    /// past `piece_count` are cleared.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let expected_bytes = piece_count.div_ceil(8);
        let mut bits = bytes.to_vec();
        bits.resize(expected_bytes, 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        let mut bf = Self {
            bits: vec![0xFF; byte_count],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield with the given pieces set.
    pub fn from_indices(piece_count: usize, indices: impl IntoIterator<Item = u32>) -> Self {
        let mut bf = Self::new(piece_count);
        for index in indices {
            bf.set(index as usize);
        }
        bf
    }

    /// Returns true if the piece at the given index is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Clears the bit for the piece at the given index.
    pub fn clear(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the total number of pieces.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts the bitfield to owned bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Sets every bit that is set in `other`.
    pub fn union_with(&mut self, other: &Bitfield) {
        for (mine, theirs) in self.bits.iter_mut().zip(&other.bits) {
            *mine |= *theirs;
        }
        self.clear_spare_bits();
    }

    /// Keeps only the bits that are also set in `other`.
    pub fn intersect_with(&mut self, other: &Bitfield) {
        for (i, mine) in self.bits.iter_mut().enumerate() {
            *mine &= other.bits.get(i).copied().unwrap_or(0);
        }
    }

    /// Clears every bit that is set in `other`.
    pub fn subtract(&mut self, other: &Bitfield) {
        for (mine, theirs) in self.bits.iter_mut().zip(&other.bits) {
            *mine &= !*theirs;
        }
    }

    /// Returns true if this bitfield has any piece that `other` lacks.
    pub fn has_any_missing_from(&self, other: &Bitfield) -> bool {
        self.bits.iter().enumerate().any(|(i, &b)| {
            let theirs = other.bits.get(i).copied().unwrap_or(0);
            b & !theirs != 0
        })
    }

    /// Returns true if any bit in the inclusive range is set.
    pub fn any_in(&self, first: usize, last: usize) -> bool {
        (first..=last.min(self.piece_count.saturating_sub(1))).any(|i| self.has(i))
    }

    /// Iterates over the indices of available pieces.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    /// Returns indices of pieces that are set here but not in `our_bitfield`.
    pub fn missing_pieces(&self, our_bitfield: &Bitfield) -> Vec<usize> {
        self.iter_set().filter(|&i| !our_bitfield.has(i)).collect()
    }

    /// Clears any spare bits in the last byte that don't correspond to pieces.
    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) - self.piece_count;
        if spare > 0 && spare < 8 && !self.bits.is_empty() {
            let mask = 0xFFu8 << spare;
            let last = self.bits.len() - 1;
            self.bits[last] &= mask;
        }
    }
}
