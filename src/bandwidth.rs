//! Bandwidth limiting using a token bucket.
//!
//! A torrent's [`Statistics`](crate::Statistics) consults a
//! [`BandwidthLimiter`] before an upload slice is sent and after a download
//! slice arrives. Unlimited directions never wait.
//!
//! # Example
//!
//! ```
//! use swarmcore::BandwidthLimiter;
//!
//! # async fn example() {
//! // 1MB/s download, upload unlimited
//! let limiter = BandwidthLimiter::new(Some(1_000_000), None);
//!
//! limiter.acquire_download(16384).await;
//! limiter.acquire_upload(16384).await;
//! # }
//! ```

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A token bucket rate limiter.
///
/// Tokens refill at the configured rate up to twice the rate, which allows
/// short bursts. Taking more tokens than are available returns how long the
/// caller has to wait to stay within the rate.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);
    }
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            bucket: Mutex::new(TokenBucket {
                tokens: rate * 2.0,
                max_tokens: rate * 2.0,
                tokens_per_sec: rate,
                last_update: Instant::now(),
            }),
        }
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let rate = bytes_per_sec.max(1) as f64;
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens_per_sec = rate;
        bucket.max_tokens = rate * 2.0;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Takes `bytes` tokens, returning the time the caller should wait.
    pub fn acquire(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());

        let wanted = bytes as f64;
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            return Duration::ZERO;
        }
        let wait = (wanted - bucket.tokens) / bucket.tokens_per_sec;
        bucket.tokens = 0.0;
        Duration::from_secs_f64(wait)
    }

    /// Takes `bytes` tokens and sleeps as long as required.
    pub async fn throttle(&self, bytes: usize) {
        let wait = self.acquire(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens as usize
    }
}

/// Separate download and upload limits for one torrent.
#[derive(Default)]
pub struct BandwidthLimiter {
    download: Option<RateLimiter>,
    upload: Option<RateLimiter>,
}

impl BandwidthLimiter {
    /// `None` leaves a direction unlimited.
    pub fn new(download_limit: Option<u64>, upload_limit: Option<u64>) -> Self {
        Self {
            download: download_limit.map(RateLimiter::new),
            upload: upload_limit.map(RateLimiter::new),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.download.is_none() && self.upload.is_none()
    }

    pub async fn acquire_download(&self, bytes: usize) {
        if let Some(limiter) = &self.download {
            limiter.throttle(bytes).await;
        }
    }

    pub async fn acquire_upload(&self, bytes: usize) {
        if let Some(limiter) = &self.upload {
            limiter.throttle(bytes).await;
        }
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("download", &self.download.is_some())
            .field("upload", &self.upload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_wait() {
        let limiter = RateLimiter::new(1000);
        assert_eq!(limiter.acquire(2000), Duration::ZERO);
        let wait = limiter.acquire(500);
        assert!(wait >= Duration::from_millis(400), "{wait:?}");
        assert!(wait <= Duration::from_millis(600), "{wait:?}");
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::unlimited();
        assert!(limiter.is_unlimited());
        let start = Instant::now();
        limiter.acquire_download(10_000_000).await;
        limiter.acquire_upload(10_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
