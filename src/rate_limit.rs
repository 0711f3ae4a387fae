use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::{Duration, interval};

use crate::metrics::RATE_LIMIT_ENTRIES;

// Rate limit entry - tracks requests per identifier ("chat:<userId>")
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: DateTime<Utc>,
}

// Longest window a policy can ask for (one year)
pub const MAX_WINDOW_SECONDS: u64 = 86_400 * 365;

// Policy attached to one route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimitConfig {
    pub fn new(limit: u32, window_seconds: u64) -> Self {
        Self { limit, window_seconds }
    }

    // Window length, clamped to MAX_WINDOW_SECONDS
    pub fn window(&self) -> ChronoDuration {
        let max = ChronoDuration::seconds(MAX_WINDOW_SECONDS as i64);
        i64::try_from(self.window_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .map_or(max, |window| window.min(max))
    }
}

// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub success: bool,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, never below one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        let millis = (self.reset - now).num_milliseconds();
        ((millis + 999) / 1000).max(1)
    }
}

/// Pluggable store for rate-limit counters.
///
/// The in-memory [`RateLimiter`] only limits per process. A backend over a
/// shared key-value store (atomic increment with expiry) gives every instance
/// the same view of a key.
#[async_trait]
pub trait RateLimitBackend: Send + Sync + 'static {
    async fn check(&self, identifier: &str, config: RateLimitConfig) -> RateLimitDecision;
}

// Process-wide fixed window limiter
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, identifier: &str, config: RateLimitConfig) -> RateLimitDecision {
        self.check_at(identifier, config, Utc::now())
    }

    // Same as check() with an explicit clock
    pub fn check_at(
        &self,
        identifier: &str,
        config: RateLimitConfig,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let reset_time = now
            .checked_add_signed(config.window())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // the shard lock is held until `entry` drops, so the whole
        // read-modify-write is atomic per key
        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                reset_time,
            });

        // fresh entry or window expired -> start over
        if entry.count == 0 || now > entry.reset_time {
            entry.count = 1;
            entry.reset_time = reset_time;
            return RateLimitDecision {
                success: true,
                remaining: config.limit.saturating_sub(1),
                reset: entry.reset_time,
            };
        }

        if entry.count >= config.limit {
            return RateLimitDecision {
                success: false,
                remaining: 0,
                reset: entry.reset_time,
            };
        }

        entry.count += 1;
        RateLimitDecision {
            success: true,
            remaining: config.limit - entry.count,
            reset: entry.reset_time,
        }
    }

    // Drop every entry whose window has passed, returns how many went away
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_time >= now);
        let after = self.entries.len();
        RATE_LIMIT_ENTRIES.set(after as f64);
        before.saturating_sub(after)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RateLimitBackend for RateLimiter {
    async fn check(&self, identifier: &str, config: RateLimitConfig) -> RateLimitDecision {
        RateLimiter::check(self, identifier, config)
    }
}

// Background sweeper - runs every `sweep_interval`
pub async fn sweeper(limiter: RateLimiter, sweep_interval: Duration) {
    let mut interval = interval(sweep_interval);

    tracing::info!(interval = ?sweep_interval, "rate limit sweeper started");

    loop {
        interval.tick().await;

        let removed = limiter.sweep();
        if removed > 0 {
            tracing::debug!(removed, live = limiter.len(), "swept expired rate limit entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn two_per_minute_rejects_third_call() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(2, 60);
        let now = t0();

        let results: Vec<_> = (0..3).map(|_| limiter.check_at("u1", config, now)).collect();

        assert_eq!(
            results.iter().map(|d| d.success).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(
            results.iter().map(|d| d.remaining).collect::<Vec<_>>(),
            vec![1, 0, 0]
        );
        assert!(results.iter().all(|d| d.reset == now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn remaining_strictly_decreases_until_limit() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(5, 10);
        let now = t0();

        let mut last = u32::MAX;
        for _ in 0..5 {
            let decision = limiter.check_at("k", config, now);
            assert!(decision.success);
            assert!(decision.remaining < last);
            last = decision.remaining;
        }

        let rejected = limiter.check_at("k", config, now);
        assert!(!rejected.success);
        assert_eq!(rejected.remaining, 0);
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(2, 60);
        let now = t0();

        limiter.check_at("u1", config, now);
        limiter.check_at("u1", config, now);
        assert!(!limiter.check_at("u1", config, now).success);

        // exactly at reset time the window is still closed
        let at_reset = now + ChronoDuration::seconds(60);
        assert!(!limiter.check_at("u1", config, at_reset).success);

        let later = at_reset + ChronoDuration::milliseconds(1);
        let decision = limiter.check_at("u1", config, later);
        assert!(decision.success);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset, later + ChronoDuration::seconds(60));
    }

    #[test]
    fn rejection_does_not_move_reset_time() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(1, 30);
        let now = t0();

        let first = limiter.check_at("k", config, now);
        let second = limiter.check_at("k", config, now + ChronoDuration::seconds(10));
        assert!(!second.success);
        assert_eq!(first.reset, second.reset);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(1, 60);
        let now = t0();

        assert!(limiter.check_at("chat:a", config, now).success);
        assert!(limiter.check_at("chat:b", config, now).success);
        assert!(limiter.check_at("code:a", config, now).success);
        assert!(!limiter.check_at("chat:a", config, now).success);
    }

    #[test]
    fn retry_after_is_rounded_up_and_positive() {
        let now = t0();
        let decision = RateLimitDecision {
            success: false,
            remaining: 0,
            reset: now + ChronoDuration::milliseconds(59_001),
        };
        assert_eq!(decision.retry_after_secs(now), 60);
        assert_eq!(decision.retry_after_secs(decision.reset), 1);
    }

    #[test]
    fn oversized_window_is_clamped_not_wrapped() {
        let limiter = RateLimiter::new();
        let now = t0();

        for window in [u64::MAX, 10_000_000_000_000_000, MAX_WINDOW_SECONDS + 1] {
            let config = RateLimitConfig::new(2, window);
            let key = format!("u-{window}");
            let results: Vec<_> = (0..3)
                .map(|_| limiter.check_at(&key, config, now).success)
                .collect();
            assert_eq!(results, vec![true, true, false]);
            assert_eq!(
                config.window(),
                ChronoDuration::seconds(MAX_WINDOW_SECONDS as i64)
            );
        }
    }

    #[test]
    fn reset_saturates_at_the_end_of_time() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::new(1, MAX_WINDOW_SECONDS);
        let late = DateTime::<Utc>::MAX_UTC - ChronoDuration::seconds(5);

        let decision = limiter.check_at("k", config, late);
        assert!(decision.success);
        assert_eq!(decision.reset, DateTime::<Utc>::MAX_UTC);
        assert!(!limiter.check_at("k", config, late).success);
    }

    #[test]
    fn sweep_removes_only_expired_windows() {
        let limiter = RateLimiter::new();
        let now = t0();

        limiter.check_at("short", RateLimitConfig::new(5, 1), now);
        limiter.check_at("long", RateLimitConfig::new(5, 600), now);
        assert_eq!(limiter.len(), 2);

        let removed = limiter.sweep_at(now + ChronoDuration::seconds(2));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test]
    async fn backend_trait_delegates_to_in_memory_table() {
        let limiter = RateLimiter::new();
        let backend: &dyn RateLimitBackend = &limiter;
        let config = RateLimitConfig::new(1, 60);

        assert!(backend.check("k", config).await.success);
        assert!(!backend.check("k", config).await.success);
    }
}
