//! Runtime configuration for a torrent's swarm.
//!
//! [`SwarmConfig`] starts from the defaults in [`crate::constants`] and is
//! adjusted with consuming `with_*` methods before a torrent is opened.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use swarmcore::{ResumeCheck, SwarmConfig};
//!
//! let config = SwarmConfig::default()
//!     .with_max_peers(40)
//!     .with_resume_check(ResumeCheck::Verify)
//!     .with_piece_wait(Duration::from_secs(20));
//!
//! assert_eq!(config.max_peers, 40);
//! ```

use std::time::Duration;

use crate::constants::*;
use crate::storage::{ResumeCheck, StoreOptions};

/// Tunable values shared by every component of one torrent.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Connections kept per pool before admission is refused.
    pub max_peers: usize,
    /// Bytes buffered per file before pending pieces are written.
    pub write_buffer_size: u64,
    /// How pieces already on disk are detected when a store is opened.
    pub resume_check: ResumeCheck,
    /// Length of one requested slice.
    pub slice_length: u32,
    /// Slice requests issued before waiting for responses.
    pub slice_request_size: usize,
    /// Outstanding requests after which the current piece is abandoned.
    pub max_wait_slice_requests: usize,
    /// Wait for a free slot in the request window.
    pub slice_wait: Duration,
    /// Wait for the current piece to complete.
    pub piece_wait: Duration,
    /// Wait for an in-flight piece on release.
    pub release_wait: Duration,
    /// Connection failures after which a peer is excluded.
    pub max_fail_times: u32,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Handshake exchange timeout.
    pub handshake_timeout: Duration,
    /// Download rate limit in bytes per second.
    pub download_limit: Option<u64>,
    /// Upload rate limit in bytes per second.
    pub upload_limit: Option<u64>,
    /// Our DHT port, announced to peers that support DHT.
    pub dht_port: Option<u16>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            write_buffer_size: DEFAULT_WRITE_BUFFER,
            resume_check: ResumeCheck::default(),
            slice_length: SLICE_LENGTH,
            slice_request_size: SLICE_REQUEST_SIZE,
            max_wait_slice_requests: MAX_WAIT_SLICE_REQUEST_SIZE,
            slice_wait: SLICE_WAIT_TIME,
            piece_wait: PIECE_WAIT_TIME,
            release_wait: RELEASE_WAIT_TIME,
            max_fail_times: MAX_FAIL_TIMES,
            connect_timeout: CONNECTION_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            download_limit: None,
            upload_limit: None,
            dht_port: None,
        }
    }
}

impl SwarmConfig {
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_write_buffer_size(mut self, bytes: u64) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_resume_check(mut self, check: ResumeCheck) -> Self {
        self.resume_check = check;
        self
    }

    pub fn with_slice_length(mut self, length: u32) -> Self {
        self.slice_length = length.clamp(1, MAX_REQUEST_LENGTH);
        self
    }

    pub fn with_slice_request_size(mut self, requests: usize) -> Self {
        self.slice_request_size = requests.max(1);
        self
    }

    pub fn with_max_wait_slice_requests(mut self, requests: usize) -> Self {
        self.max_wait_slice_requests = requests;
        self
    }

    pub fn with_slice_wait(mut self, wait: Duration) -> Self {
        self.slice_wait = wait;
        self
    }

    pub fn with_piece_wait(mut self, wait: Duration) -> Self {
        self.piece_wait = wait;
        self
    }

    pub fn with_release_wait(mut self, wait: Duration) -> Self {
        self.release_wait = wait;
        self
    }

    pub fn with_max_fail_times(mut self, times: u32) -> Self {
        self.max_fail_times = times;
        self
    }

    pub fn with_download_limit(mut self, bytes_per_sec: u64) -> Self {
        self.download_limit = Some(bytes_per_sec);
        self
    }

    pub fn with_upload_limit(mut self, bytes_per_sec: u64) -> Self {
        self.upload_limit = Some(bytes_per_sec);
        self
    }

    pub fn with_dht_port(mut self, port: u16) -> Self {
        self.dht_port = Some(port);
        self
    }

    /// The storage subset of this configuration.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            write_buffer_size: self.write_buffer_size,
            resume_check: self.resume_check,
        }
    }
}
