//! # Per-Connection Rate Limiting
//!
//! Each connection gets a token bucket measured in bytes of serialized
//! envelope. A message larger than the current balance is refused and earns
//! a strike; `max_strikes` strikes inside one strike window block the
//! connection outright for `block_duration`.
//!
//! | Parameter | Default |
//! |-----------|---------|
//! | `bytes_per_second` | 64 000 |
//! | `burst_bytes` | 256 000 |
//! | `max_strikes` | 3 |
//! | `strike_window` | 5 s |
//! | `block_duration` | 30 s |
//!
//! SECURITY: State is held in an LRU bounded by [`MAX_RATE_LIMIT_ENTRIES`],
//! so connection churn cannot grow it without limit. Evicting an entry only
//! forgets history; a returning connection starts with a full bucket.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::protocols::ConnectionId;

pub const DEFAULT_RATE_BYTES_PER_SECOND: u64 = 64_000;
pub const DEFAULT_RATE_BURST_BYTES: u64 = 256_000;
pub const DEFAULT_MAX_STRIKES: u32 = 3;
pub const DEFAULT_STRIKE_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(30);

/// Maximum number of connections with tracked limiter state.
pub const MAX_RATE_LIMIT_ENTRIES: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub bytes_per_second: u64,
    pub burst_bytes: u64,
    pub max_strikes: u32,
    pub strike_window: Duration,
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: DEFAULT_RATE_BYTES_PER_SECOND,
            burst_bytes: DEFAULT_RATE_BURST_BYTES,
            max_strikes: DEFAULT_MAX_STRIKES,
            strike_window: DEFAULT_STRIKE_WINDOW,
            block_duration: DEFAULT_BLOCK_DURATION,
        }
    }
}

#[derive(Clone, Debug)]
struct BucketState {
    /// Always within `[0, burst_bytes]`.
    tokens: f64,
    last_refill: Instant,
    strikes: u32,
    strike_reset_at: Instant,
    blocked_until: Option<Instant>,
}

impl BucketState {
    fn fresh(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst_bytes as f64,
            last_refill: now,
            strikes: 0,
            strike_reset_at: now + config.strike_window,
            blocked_until: None,
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Not enough tokens; a strike was recorded.
    Refused,
    /// This refusal crossed the strike threshold and started a block.
    BlockStarted,
    /// The connection is inside an earlier block window.
    Blocked,
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: LruCache<ConnectionId, BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let cap = NonZeroUsize::new(MAX_RATE_LIMIT_ENTRIES)
            .expect("MAX_RATE_LIMIT_ENTRIES must be non-zero");
        Self {
            config,
            buckets: LruCache::new(cap),
        }
    }

    /// Charge `bytes` against the connection's bucket.
    pub fn check(&mut self, connection: ConnectionId, bytes: usize, now: Instant) -> RateDecision {
        let config = self.config;
        let state = self
            .buckets
            .get_or_insert_mut(connection, || BucketState::fresh(&config, now));

        if state.is_blocked(now) {
            return RateDecision::Blocked;
        }

        if now > state.strike_reset_at {
            state.strikes = 0;
            state.strike_reset_at = now + config.strike_window;
        }

        let elapsed = now.saturating_duration_since(state.last_refill);
        if !elapsed.is_zero() {
            let refill = elapsed.as_secs_f64() * config.bytes_per_second as f64;
            state.tokens = (state.tokens + refill).min(config.burst_bytes as f64);
            state.last_refill = now;
        }

        let cost = bytes as f64;
        if cost > state.tokens {
            state.strikes = state.strikes.saturating_add(1);
            if state.strikes >= config.max_strikes {
                state.blocked_until = Some(now + config.block_duration);
                return RateDecision::BlockStarted;
            }
            return RateDecision::Refused;
        }

        state.tokens -= cost;
        RateDecision::Allowed
    }

    /// `true` while the connection is inside its block window. Never creates state.
    pub fn is_blocked(&self, connection: ConnectionId, now: Instant) -> bool {
        self.buckets
            .peek(&connection)
            .is_some_and(|state| state.is_blocked(now))
    }

    pub fn remove(&mut self, connection: ConnectionId) {
        self.buckets.pop(&connection);
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    fn tokens(&self, connection: ConnectionId) -> Option<f64> {
        self.buckets.peek(&connection).map(|state| state.tokens)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
