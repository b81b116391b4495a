//! Token-bucket throttling for provider requests.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Burst capacity.
    pub max_tokens: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    pub initial_tokens: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        // 5 req/s with a 2x burst.
        Self {
            max_tokens: 10,
            refill_rate: 5.0,
            initial_tokens: 10,
        }
    }
}

impl RateLimiterConfig {
    /// Config for `rps` requests per second with a burst of `burst` × `rps`.
    pub fn with_rps(rps: f64, burst: f64) -> Result<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return Err(Error::config(format!(
                "rate limit must be a positive finite number, got {rps}"
            )));
        }
        if !burst.is_finite() || burst < 1.0 {
            return Err(Error::config(format!("burst factor must be >= 1, got {burst}")));
        }
        let max_tokens = (rps * burst).ceil().max(1.0) as u32;
        Ok(Self {
            max_tokens,
            refill_rate: rps,
            initial_tokens: max_tokens,
        })
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token-bucket limiter.
///
/// `acquire` is cancel-safe: the lock is never held across an await, so a
/// dropped waiter consumes nothing.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: config.initial_tokens.min(config.max_tokens) as f64,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take a token if one is available.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait().is_none()
    }

    /// Wait for a token. Returns the time spent waiting, or
    /// [`Error::Cancelled`] if `token` fires first.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<Duration> {
        let mut waited = Duration::ZERO;
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(wait) = self.take_or_wait() else {
                return Ok(waited);
            };
            trace!(wait = ?wait, "rate limited");
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            // Another caller may have won the token; retry.
            waited += wait;
        }
    }

    /// Currently available tokens.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// `None` when a token was taken, otherwise the time until one is due.
    fn take_or_wait(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            Some(Duration::from_secs_f64(missing / self.config.refill_rate))
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.config.refill_rate).min(self.config.max_tokens as f64);
        bucket.last_refill = now;
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
