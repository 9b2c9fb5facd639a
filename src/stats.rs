//! Transfer statistics.
//!
//! Every peer session and every torrent carries a [`Statistics`]. A peer's
//! statistics point at the torrent's as their parent, so one call records
//! the bytes at both levels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::bandwidth::BandwidthLimiter;
use crate::constants::{SPEED_CACHE_TIME, SPEED_SAMPLE_INTERVAL};

/// Bytes-per-second estimate for one direction.
#[derive(Debug)]
struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    last_sample: Instant,
    bytes_per_sec: u64,
}

impl SpeedMeter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            window_start: now,
            window_bytes: 0,
            last_sample: now,
            bytes_per_sec: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let now = Instant::now();
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= SPEED_SAMPLE_INTERVAL {
            self.bytes_per_sec = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.window_start = now;
            self.window_bytes = 0;
            self.last_sample = now;
        }
    }

    fn speed(&self) -> u64 {
        if self.last_sample.elapsed() > SPEED_CACHE_TIME {
            0
        } else {
            self.bytes_per_sec
        }
    }
}

/// Cumulative upload and download counters with speed sampling.
#[derive(Debug)]
pub struct Statistics {
    parent: Option<Arc<Statistics>>,
    limiter: Option<Arc<BandwidthLimiter>>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    upload_speed: Mutex<SpeedMeter>,
    download_speed: Mutex<SpeedMeter>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            parent: None,
            limiter: None,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            upload_speed: Mutex::new(SpeedMeter::new()),
            download_speed: Mutex::new(SpeedMeter::new()),
        }
    }

    /// Statistics whose records also roll up into `parent`.
    pub fn with_parent(parent: Arc<Statistics>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new()
        }
    }

    /// Attaches a rate limiter consulted by [`Statistics::limit_download`]
    /// and [`Statistics::limit_upload`].
    pub fn with_limiter(mut self, limiter: Arc<BandwidthLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.download_speed.lock().record(bytes);
        if let Some(parent) = &self.parent {
            parent.record_download(bytes);
        }
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.upload_speed.lock().record(bytes);
        if let Some(parent) = &self.parent {
            parent.record_upload(bytes);
        }
    }

    /// Waits until `bytes` fit in the download limit of this level and
    /// every parent.
    pub async fn limit_download(&self, bytes: usize) {
        let mut level = Some(self);
        while let Some(stats) = level {
            if let Some(limiter) = &stats.limiter {
                limiter.acquire_download(bytes).await;
            }
            level = stats.parent.as_deref();
        }
    }

    pub async fn limit_upload(&self, bytes: usize) {
        let mut level = Some(self);
        while let Some(stats) = level {
            if let Some(limiter) = &stats.limiter {
                limiter.acquire_upload(bytes).await;
            }
            level = stats.parent.as_deref();
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Restores counters persisted by the task owner.
    pub fn restore(&self, downloaded: u64, uploaded: u64) {
        self.downloaded.store(downloaded, Ordering::Relaxed);
        self.uploaded.store(uploaded, Ordering::Relaxed);
    }

    /// Download speed in bytes per second; zero once the last sample is stale.
    pub fn download_speed(&self) -> u64 {
        self.download_speed.lock().speed()
    }

    pub fn upload_speed(&self) -> u64 {
        self.upload_speed.lock().speed()
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}
