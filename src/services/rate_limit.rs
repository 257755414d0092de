//! Fixed-window admission limiter.
//!
//! Counters live in process memory. Several instances behind a load balancer
//! each enforce their own limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Window length and request budget of one limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, never below 1 for a denied request.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// Per-identifier fixed-window counter.
pub struct RateLimiter {
    name: &'static str,
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> u32 {
        self.config.max_requests
    }

    pub fn check(&self, identifier: &str) -> RateLimitDecision {
        self.check_at(identifier, Utc::now())
    }

    pub fn check_at(&self, identifier: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let max = self.config.max_requests;
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let fresh = RateLimitEntry {
            count: 0,
            window_reset_at: now + window,
        };

        let mut entries = self.entries.lock();
        let entry = entries.entry(identifier.to_string()).or_insert(fresh);
        // An expired window is replaced, never incremented.
        if now > entry.window_reset_at {
            *entry = fresh;
        }

        let allowed = entry.count < max;
        if allowed {
            entry.count += 1;
        }
        RateLimitDecision {
            allowed,
            limit: max,
            remaining: max.saturating_sub(entry.count),
            reset_at: entry.window_reset_at,
        }
    }

    /// Remove windows that have already reset.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.window_reset_at);
        before - entries.len()
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Isolated limiters per route class.
pub struct RateLimiters {
    pub api: Arc<RateLimiter>,
    pub auth: Arc<RateLimiter>,
    pub processing: Arc<RateLimiter>,
    pub analytics: Arc<RateLimiter>,
}

impl RateLimiters {
    pub fn all(&self) -> [&Arc<RateLimiter>; 4] {
        [&self.api, &self.auth, &self.processing, &self.analytics]
    }

    /// Periodically drop expired windows from every limiter.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                for limiter in self.all() {
                    let removed = limiter.sweep_at(now);
                    if removed > 0 {
                        tracing::debug!(limiter = limiter.name(), removed, "Swept expired rate-limit windows");
                    }
                }
            }
        })
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
        Self {
            api: Arc::new(RateLimiter::new("api", RateLimitConfig::new(FIFTEEN_MINUTES, 100))),
            auth: Arc::new(RateLimiter::new("auth", RateLimitConfig::new(FIFTEEN_MINUTES, 5))),
            processing: Arc::new(RateLimiter::new(
                "processing",
                RateLimitConfig::new(FIFTEEN_MINUTES, 20),
            )),
            analytics: Arc::new(RateLimiter::new(
                "analytics",
                RateLimitConfig::new(Duration::from_secs(60), 60),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new("test", RateLimitConfig::new(Duration::from_secs(60), max))
    }

    #[test]
    fn test_sixth_request_denied() {
        let limiter = limiter(5);
        let now = Utc::now();

        for expected_remaining in (0..5).rev() {
            let decision = limiter.check_at("1.2.3.4", now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.check_at("1.2.3.4", now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn test_fresh_window_after_reset() {
        let limiter = limiter(5);
        let start = Utc::now();
        for _ in 0..6 {
            limiter.check_at("1.2.3.4", start);
        }
        let first_reset = limiter.check_at("1.2.3.4", start).reset_at;

        let later = first_reset + chrono::Duration::milliseconds(1);
        let decision = limiter.check_at("1.2.3.4", later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert!(decision.reset_at > first_reset);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = limiter(1);
        let now = Utc::now();
        assert!(limiter.check_at("a", now).allowed);
        assert!(!limiter.check_at("a", now).allowed);
        assert!(limiter.check_at("b", now).allowed);
    }

    #[test]
    fn test_limiter_classes_are_isolated() {
        let limiters = RateLimiters::default();
        for _ in 0..5 {
            assert!(limiters.auth.check("9.9.9.9").allowed);
        }
        assert!(!limiters.auth.check("9.9.9.9").allowed);
        assert!(limiters.api.check("9.9.9.9").allowed);
        assert_eq!(limiters.processing.limit(), 20);
    }

    #[test]
    fn test_sweep_drops_expired_windows() {
        let limiter = limiter(5);
        let now = Utc::now();
        limiter.check_at("old", now);
        limiter.check_at("new", now + chrono::Duration::seconds(50));

        let removed = limiter.sweep_at(now + chrono::Duration::seconds(61));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let decision = RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(1500),
        };
        assert_eq!(decision.retry_after_secs(now), 2);
    }
}
