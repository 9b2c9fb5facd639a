//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used throughout the swarm engine,
//! including wire protocol values, slice pipelining limits, timeouts and
//! storage buffering defaults.
//!
//! Every runtime-tunable value here is only a default: [`SwarmConfig`]
//! carries the values actually used by a running torrent.
//!
//! [`SwarmConfig`]: crate::SwarmConfig

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-SW0001-";

// ============================================================================
// Handshake
// ============================================================================

/// Protocol name sent in the handshake
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Full handshake length: pstrlen + pstr + reserved + info hash + peer id
pub const HANDSHAKE_LEN: usize = 68;

/// Number of reserved capability bytes in the handshake
pub const RESERVED_LEN: usize = 8;

// ============================================================================
// Connection limits
// ============================================================================

/// Default number of connections kept per pool
pub const DEFAULT_MAX_PEERS: usize = 20;

/// Connection failures after which a peer is no longer admitted
pub const MAX_FAIL_TIMES: u32 = 3;

// ============================================================================
// Slices and pieces
// ============================================================================

/// Standard slice (block) size (16KB)
pub const SLICE_LENGTH: u32 = 16384;

/// Maximum request length accepted from a peer (128KB)
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Slice requests issued before waiting for a response
pub const SLICE_REQUEST_SIZE: usize = 2;

/// Outstanding slice requests after which the current piece is abandoned
pub const MAX_WAIT_SLICE_REQUEST_SIZE: usize = 4;

// ============================================================================
// Timeouts
// ============================================================================

/// Wait for a slot in the slice request window
pub const SLICE_WAIT_TIME: Duration = Duration::from_secs(10);

/// Wait for every slice of the current piece to arrive
pub const PIECE_WAIT_TIME: Duration = Duration::from_secs(30);

/// Wait for an in-flight piece when a connection is released
pub const RELEASE_WAIT_TIME: Duration = Duration::from_secs(4);

/// TCP connection timeout
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake timeout after TCP connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer read timeout
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Peer write timeout
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle time after which a keep-alive is sent, below the remote's read timeout
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);

// ============================================================================
// Storage
// ============================================================================

/// Bytes buffered per file before pending pieces are written out (4MB)
pub const DEFAULT_WRITE_BUFFER: u64 = 4194304;

/// Leading bytes of a piece inspected by the resume scan
pub const RESUME_SAMPLE_SIZE: usize = 10;

// ============================================================================
// Buffer sizes
// ============================================================================

/// Read buffer size for peer connections (32KB)
pub const READ_BUFFER_SIZE: usize = 32768;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16777216;

/// Capacity of the per-torrent `have` broadcast channel
pub const HAVE_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Statistics
// ============================================================================

/// Speed sampling interval
pub const SPEED_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// A speed sample older than this reads as zero
pub const SPEED_CACHE_TIME: Duration = Duration::from_secs(4);
