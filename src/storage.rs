//! Piece storage.
//!
//! Torrent data is one contiguous byte range (piece-space) split into
//! fixed-size pieces and laid across one or more files. Each file gets a
//! [`PieceStore`] that owns every piece overlapping its byte range; the
//! pieces at either end may be shared with neighbouring files.
//!
//! # Components
//!
//! - [`TorrentLayout`] - Piece length, file offsets and piece hashes
//! - [`PieceStore`] - One file's share of the piece space
//! - [`StoreGroup`] - All stores of a torrent behind a single pick/put API
//! - [`PieceDescriptor`] - A picked piece being assembled from slices
//!
//! # Lifecycle of a piece
//!
//! A piece starts out missing. [`StoreGroup::pick`] marks it downloading;
//! from there it is either `put` (downloaded, buffered, eventually written)
//! or `undone` (marked bad and skipped for one pick, then eligible again).
//! No piece is ever both downloaded and downloading.
//!
//! # Examples
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//! use swarmcore::storage::{StoreGroup, StoreOptions, TorrentLayout};
//! use swarmcore::Bitfield;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let layout = Arc::new(TorrentLayout::from_files(
//!     [0u8; 20],
//!     16384,
//!     vec![(PathBuf::from("movie/part1.bin"), 20000), (PathBuf::from("movie/part2.bin"), 5000)],
//!     vec![[0u8; 20]; 2],
//! )?);
//!
//! let group = StoreGroup::open(layout, Path::new("./downloads"), None, StoreOptions::default()).await?;
//!
//! // A peer that has everything.
//! let remote = Bitfield::full(2);
//! if let Some(descriptor) = group.pick(&remote) {
//!     println!("downloading piece {}", descriptor.index());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths are validated when the layout is built. Paths containing `..`
//! or absolute paths are rejected.

mod error;
mod group;
mod layout;
mod piece;
mod store;

pub use error::StoreError;
pub use group::StoreGroup;
pub use layout::{FileEntry, TorrentLayout};
pub use piece::{sha1_digest, Piece, PieceDescriptor, SliceRequest};
pub use store::{PieceStore, ResumeCheck, StoreOptions};
