//! Rate limiting of misbehaving sources
//!
//! Every packet dropped as malformed or badly signed counts against its
//! source address in a sliding window. A source over the limit is ignored
//! until enough of its drops have left the window.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Dropped packets tolerated per source within the window
    pub max_drops_per_source: u32,
    /// Window duration
    pub window_duration: Duration,
    /// Whether rate limiting is enabled
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_drops_per_source: 50,
            window_duration: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Packet is processed
    Allowed,
    /// Source is ignored
    Limited {
        /// Time until the oldest drop leaves the window
        retry_after: Duration,
    },
}

/// Sliding window of drop timestamps
#[derive(Debug)]
struct SlidingWindow {
    drops: Vec<Instant>,
}

impl SlidingWindow {
    fn new() -> Self {
        Self { drops: Vec::new() }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        let cutoff = now.checked_sub(window).unwrap_or(now);
        self.drops.retain(|&t| t > cutoff);
    }

    fn check(&self, max: u32, window: Duration, now: Instant) -> RateLimitResult {
        let cutoff = now.checked_sub(window).unwrap_or(now);
        let active: Vec<&Instant> = self.drops.iter().filter(|&&t| t > cutoff).collect();
        if active.len() >= max as usize {
            let retry_after = active
                .first()
                .map(|&&oldest| window.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(window);
            return RateLimitResult::Limited { retry_after };
        }
        RateLimitResult::Allowed
    }
}

/// Per-source drop limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    sources: HashMap<SocketAddrV4, SlidingWindow>,
    /// Number of recorded drops since construction.
    record_counter: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Run opportunistic cleanup after this many recorded drops.
    const AUTO_CLEANUP_INTERVAL: u64 = 64;

    /// Create a new rate limiter with default config
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    /// Create a new rate limiter with custom config
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            sources: HashMap::new(),
            record_counter: 0,
        }
    }

    /// Whether packets from `source` should be processed.
    pub fn check(&self, source: &SocketAddrV4, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::Allowed;
        }
        match self.sources.get(source) {
            Some(window) => window.check(self.config.max_drops_per_source, self.config.window_duration, now),
            None => RateLimitResult::Allowed,
        }
    }

    /// Count a dropped packet against `source`.
    pub fn record_drop(&mut self, source: SocketAddrV4, now: Instant) {
        if !self.config.enabled {
            return;
        }
        let window = self.config.window_duration;
        let entry = self.sources.entry(source).or_insert_with(SlidingWindow::new);
        entry.prune(window, now);
        entry.drops.push(now);

        self.record_counter = self.record_counter.saturating_add(1);
        if self.record_counter % Self::AUTO_CLEANUP_INTERVAL == 0 {
            self.cleanup(now);
        }
    }

    /// Forget sources without drops in the window
    pub fn cleanup(&mut self, now: Instant) {
        let window = self.config.window_duration;
        self.sources.retain(|_, w| {
            w.prune(window, now);
            !w.drops.is_empty()
        });
    }

    /// Number of tracked sources
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn source(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    fn config(max: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_drops_per_source: max,
            window_duration: Duration::from_secs(60),
            enabled: true,
        }
    }

    #[test]
    fn test_source_limited_after_max_drops() {
        let now = Instant::now();
        let mut limiter = RateLimiter::with_config(config(3));
        for _ in 0..2 {
            limiter.record_drop(source(1), now);
            assert_eq!(limiter.check(&source(1), now), RateLimitResult::Allowed);
        }
        limiter.record_drop(source(1), now);
        assert!(matches!(
            limiter.check(&source(1), now),
            RateLimitResult::Limited { .. }
        ));
        // Other sources are unaffected
        assert_eq!(limiter.check(&source(2), now), RateLimitResult::Allowed);
    }

    #[test]
    fn test_window_expiry() {
        let now = Instant::now();
        let mut limiter = RateLimiter::with_config(config(1));
        limiter.record_drop(source(1), now);

        match limiter.check(&source(1), now + Duration::from_secs(20)) {
            RateLimitResult::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(40)),
            other => panic!("expected limited, got {:?}", other),
        }
        assert_eq!(
            limiter.check(&source(1), now + Duration::from_secs(61)),
            RateLimitResult::Allowed
        );
    }

    #[test]
    fn test_disabled_limiter() {
        let now = Instant::now();
        let mut limiter = RateLimiter::with_config(RateLimitConfig {
            enabled: false,
            ..config(1)
        });
        limiter.record_drop(source(1), now);
        assert_eq!(limiter.check(&source(1), now), RateLimitResult::Allowed);
        assert_eq!(limiter.tracked_sources(), 0);
    }

    #[test]
    fn test_cleanup() {
        let now = Instant::now();
        let mut limiter = RateLimiter::with_config(config(5));
        limiter.record_drop(source(1), now);
        limiter.record_drop(source(2), now + Duration::from_secs(50));
        limiter.cleanup(now + Duration::from_secs(70));
        assert_eq!(limiter.tracked_sources(), 1);
    }
}
