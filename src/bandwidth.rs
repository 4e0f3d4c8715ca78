//! Upload rate limiting using a token bucket.
//!
//! The limiter never blocks: [`RateLimiter::reserve`] either takes the
//! tokens or reports how long until enough will have accrued, so it can be
//! consulted while the client lock is held.
//!
//! # Example
//!
//! ```
//! use rswarm::bandwidth::RateLimiter;
//!
//! let limiter = RateLimiter::new(32 * 1024);
//! assert!(limiter.reserve(16384).is_ok());
//!
//! let unlimited = RateLimiter::unlimited();
//! assert!(unlimited.reserve(usize::MAX / 2).is_ok());
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::constants::CHUNK_SIZE;

/// A token bucket rate limiter.
///
/// Tokens are bytes. The bucket holds up to two seconds of rate, and never
/// less than one chunk. A reservation larger than the bucket is granted once
/// the bucket is full and leaves it in debt, so later reservations wait for
/// the debt to be repaid.
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

fn burst_for(bytes_per_sec: u64) -> f64 {
    (bytes_per_sec.saturating_mul(2)).max(CHUNK_SIZE as u64) as f64
}

impl RateLimiter {
    /// Creates a limiter for `bytes_per_sec`. Zero means unlimited.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        let max_tokens = burst_for(bytes_per_sec);
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_update: Instant::now(),
            }),
        })
    }

    /// Creates an unlimited rate limiter that always grants.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: f64::MAX,
                max_tokens: f64::MAX,
                tokens_per_sec: f64::MAX,
                last_update: Instant::now(),
            }),
        })
    }

    /// Updates the rate limit. Zero means unlimited.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        if bytes_per_sec == 0 {
            bucket.tokens_per_sec = f64::MAX;
            bucket.max_tokens = f64::MAX;
            bucket.tokens = f64::MAX;
            return;
        }
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = burst_for(bytes_per_sec);
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Takes `bytes` tokens if available, otherwise returns how long until
    /// they would be. Nothing is consumed on failure.
    pub fn reserve(&self, bytes: usize) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());

        let wanted = bytes as f64;
        let affordable = wanted.min(bucket.max_tokens);
        if bucket.tokens >= affordable {
            bucket.tokens -= wanted;
            return Ok(());
        }
        let needed = affordable - bucket.tokens;
        Err(Duration::from_secs_f64(needed.max(0.0) / bucket.tokens_per_sec)
            .max(Duration::from_millis(1)))
    }

    /// Returns the currently available tokens (bytes).
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens as usize
    }
}
