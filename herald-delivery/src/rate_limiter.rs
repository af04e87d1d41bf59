//! Per-collapse-key rate limiting using the token bucket algorithm
//!
//! Messages sharing a collapse key usually target the same stream of updates,
//! so each collapse key gets its own bucket with configurable limits.
//!
//! # Token Bucket Algorithm
//!
//! - Tokens are added to the bucket at a constant rate (`refill_rate`)
//! - Each message consumes one token
//! - If no tokens available, the message is rescheduled until one refills
//! - Bucket has maximum capacity (allows bursts)
//!
//! The limiter runs as a dequeue filter. A message that another filter has
//! already delayed or cancelled does not take a token.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    context::MessageContext,
    handlers::{MessageFilter, Stage},
};

/// Configuration for rate limiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Default messages per second per collapse key
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: f64,

    /// Default burst size (max tokens in bucket)
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Per-collapse-key overrides
    #[serde(default)]
    pub key_limits: ahash::AHashMap<String, KeyRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: default_messages_per_second(),
            burst_size: default_burst_size(),
            key_limits: ahash::AHashMap::default(),
        }
    }
}

const fn default_messages_per_second() -> f64 {
    10.0
}

const fn default_burst_size() -> u32 {
    20
}

/// Rate limit for one collapse key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRateLimit {
    pub messages_per_second: f64,
    pub burst_size: u32,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(messages_per_second: f64, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: messages_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available
    fn acquire(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_rate <= 0.0 {
            // A bucket that never refills blocks for good; retry once a second
            return Err(Duration::from_secs(1));
        }

        let tokens_needed = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(tokens_needed / self.refill_rate))
    }
}

/// Token-bucket [`MessageFilter`] keyed by collapse key
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<parking_lot::Mutex<TokenBucket>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, key: &str) -> Arc<parking_lot::Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(&bucket);
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                let (messages_per_second, burst_size) = self.config.key_limits.get(key).map_or(
                    (self.config.messages_per_second, self.config.burst_size),
                    |limit| (limit.messages_per_second, limit.burst_size),
                );

                Arc::new(parking_lot::Mutex::new(TokenBucket::new(
                    messages_per_second,
                    burst_size,
                )))
            })
            .clone()
    }

    /// Check if a message with `key` can be sent now
    ///
    /// Returns `Ok(())` if allowed, `Err(Duration)` with wait time if rate limited
    pub fn check_rate_limit(&self, key: &str) -> Result<(), Duration> {
        let bucket = self.bucket(key);
        let result = bucket.lock().acquire();

        if let Err(wait) = result {
            tracing::debug!(
                collapse_key = key,
                wait_seconds = wait.as_secs_f64(),
                "Rate limit exceeded, must wait"
            );
        }

        result
    }

    /// Tokens currently available for `key`, `None` if it was never used
    pub fn available_tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| {
            let mut bucket = bucket.lock();
            bucket.refill();
            bucket.tokens
        })
    }
}

impl MessageFilter for RateLimiter {
    fn filter(&self, stage: Stage, context: &mut MessageContext) {
        if stage != Stage::Dequeue || context.is_cancelled() || !context.delay().is_zero() {
            return;
        }

        if let Err(wait) = self.check_rate_limit(context.message().collapse_key()) {
            context.raise_delay(wait);
        }
    }
}
