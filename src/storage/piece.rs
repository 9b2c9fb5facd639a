use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::constants::SLICE_LENGTH;

/// A request for one slice of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl SliceRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

/// A verified piece ready to be persisted.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: u32,
    pub data: Bytes,
}

impl Piece {
    pub fn new(index: u32, data: Bytes) -> Self {
        Self { index, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A piece selected for download, assembled slice by slice.
///
/// Returned by [`StoreGroup::pick`](super::StoreGroup::pick). The descriptor
/// hands out slice requests in order, collects the responses and verifies
/// the assembled piece against its SHA-1 hash.
#[derive(Debug)]
pub struct PieceDescriptor {
    index: u32,
    length: u32,
    hash: [u8; 20],
    slice_length: u32,
    position: u32,
    received: Vec<bool>,
    received_bytes: u32,
    data: BytesMut,
}

impl PieceDescriptor {
    pub fn new(index: u32, length: u32, hash: [u8; 20]) -> Self {
        let mut descriptor = Self {
            index,
            length,
            hash,
            slice_length: SLICE_LENGTH,
            position: 0,
            received: Vec::new(),
            received_bytes: 0,
            data: BytesMut::zeroed(length as usize),
        };
        descriptor.reset_slices();
        descriptor
    }

    /// Changes the slice size. Only meaningful before the first request.
    pub fn with_slice_length(mut self, slice_length: u32) -> Self {
        self.slice_length = slice_length.max(1);
        self.reset_slices();
        self
    }

    fn reset_slices(&mut self) {
        let count = self.length.div_ceil(self.slice_length) as usize;
        self.received = vec![false; count];
        self.received_bytes = 0;
        self.position = 0;
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Offset of the next slice to request.
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn slice_count(&self) -> usize {
        self.received.len()
    }

    pub fn has_more_slices(&self) -> bool {
        self.position < self.length
    }

    /// Returns the next slice to request, the last one truncated to the
    /// remainder of the piece.
    pub fn next_slice(&mut self) -> Option<SliceRequest> {
        if !self.has_more_slices() {
            return None;
        }
        let offset = self.position;
        let length = (self.length - offset).min(self.slice_length);
        self.position += length;
        Some(SliceRequest::new(self.index, offset, length))
    }

    /// Stores a received slice, returning whether the piece is now complete.
    ///
    /// Slices that are misaligned, out of range, the wrong length or already
    /// received are ignored and yield `None`.
    pub fn put(&mut self, begin: u32, data: &[u8]) -> Option<bool> {
        if begin % self.slice_length != 0 {
            return None;
        }
        let slot = (begin / self.slice_length) as usize;
        let expected = (self.length.saturating_sub(begin)).min(self.slice_length) as usize;
        if slot >= self.received.len() || self.received[slot] || data.len() != expected {
            return None;
        }

        let start = begin as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.received[slot] = true;
        self.received_bytes += data.len() as u32;
        Some(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received_bytes == self.length
    }

    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    /// Checks the assembled bytes against the expected SHA-1 digest.
    pub fn verify(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        hasher.finalize().as_slice() == self.hash
    }

    /// Consumes the descriptor, yielding the assembled piece.
    pub fn into_piece(self) -> Piece {
        Piece::new(self.index, self.data.freeze())
    }
}

/// SHA-1 digest helper shared by resume verification and tests.
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
