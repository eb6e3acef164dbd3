//! Fixed-window request counting

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue, header::RETRY_AFTER};
use tokio::time::Instant;

use super::RateLimitConfig;
use crate::Site;
use crate::sweeper::Sweeper;

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const WINDOW_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-window");

/// What a rate-limit bucket is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStrategy {
    /// One bucket per client per Site
    #[default]
    SiteIp,
    /// One bucket per client across all Sites
    Ip,
    /// One bucket per Site shared by all clients
    Site,
}

impl KeyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::SiteIp => "site_ip",
            KeyStrategy::Ip => "ip",
            KeyStrategy::Site => "site",
        }
    }
}

impl FromStr for KeyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "site_ip" | "site-ip" => Ok(KeyStrategy::SiteIp),
            "ip" => Ok(KeyStrategy::Ip),
            "site" => Ok(KeyStrategy::Site),
            other => Err(format!("unknown rate limit key: {}", other)),
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter for one key in the current window
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: Instant,
    /// Set once the count has gone over the limit in this window
    pub blocked: bool,
}

impl RateLimitEntry {
    fn new(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            reset_time: now + window,
            blocked: false,
        }
    }
}

/// Outcome of counting one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limited: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the window resets
    pub reset_after: Duration,
    pub window: Duration,
}

impl RateLimitDecision {
    /// Whole seconds to wait before retrying, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let secs = if self.reset_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        secs.max(1)
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` when limited.
    pub fn headers(&self) -> HeaderMap {
        let reset_at = chrono::Utc::now().timestamp() + self.retry_after_secs() as i64;
        let mut headers = HeaderMap::new();
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(reset_at));
        headers.insert(WINDOW_HEADER, HeaderValue::from(self.window.as_secs()));
        if self.limited {
            headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs()));
        }
        headers
    }
}

/// Best-effort client address from proxy headers.
///
/// Tries `x-forwarded-for` (first hop), `x-real-ip`, then
/// `cf-connecting-ip`. Values that are not IP addresses are skipped.
/// Returns `"unknown"` when nothing usable is present, so all such clients
/// share one bucket per Site.
pub fn client_ip(headers: &HeaderMap) -> String {
    let candidates = [
        headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.split(',').next()),
        headers.get("x-real-ip").and_then(|h| h.to_str().ok()),
        headers.get("cf-connecting-ip").and_then(|h| h.to_str().ok()),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find_map(|candidate| candidate.parse::<IpAddr>().ok())
        .map_or_else(|| "unknown".to_owned(), |ip| ip.to_string())
}

/// Fixed-window rate limiter
///
/// Windows start at a key's first request; the count resets on the first
/// request after the window elapses. The request path is not part of the
/// key.
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key_for(&self, site: &Site, ip: &str) -> String {
        match self.config.key {
            KeyStrategy::SiteIp => format!("{}:{}", site.id, ip),
            KeyStrategy::Ip => format!("ip:{}", ip),
            KeyStrategy::Site => format!("site:{}", site.id),
        }
    }

    /// Count one request against `key`.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.config.window;
        let limit = self.config.max_requests;

        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| RateLimitEntry::new(now, window));
        if now > entry.reset_time {
            *entry = RateLimitEntry::new(now, window);
        }
        entry.count = entry.count.saturating_add(1);
        let limited = entry.count > limit;
        if limited {
            entry.blocked = true;
        }

        RateLimitDecision {
            limited,
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_after: entry.reset_time.saturating_duration_since(now),
            window,
        }
    }

    /// Drop entries whose window has elapsed; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.reset_time);
        before.saturating_sub(self.entries.len())
    }

    /// Start the periodic purge of elapsed windows.
    pub fn spawn_cleanup(self: &Arc<Self>) -> Sweeper {
        let limiter: Weak<Self> = Arc::downgrade(self);
        Sweeper::spawn("rate-limit-cleanup", self.config.cleanup_interval, move || {
            limiter.upgrade().map_or(0, |limiter| limiter.purge_expired())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            ..RateLimitConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_limits_after_max_requests() {
        let limiter = limiter(100);
        for i in 1..=100u32 {
            let decision = limiter.check("s1:10.0.0.1");
            assert!(!decision.limited, "request {} should pass", i);
            assert_eq!(decision.remaining, 100 - i);
        }
        for _ in 101..=105 {
            let decision = limiter.check("s1:10.0.0.1");
            assert!(decision.limited);
            assert_eq!(decision.remaining, 0);
        }
        assert!(limiter.entries.get("s1:10.0.0.1").unwrap().blocked);

        // Other keys are unaffected.
        assert!(!limiter.check("s1:10.0.0.2").limited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(2);
        limiter.check("k");
        limiter.check("k");
        assert!(limiter.check("k").limited);

        tokio::time::advance(Duration::from_secs(61)).await;
        let decision = limiter.check("k");
        assert!(!decision.limited);
        assert_eq!(decision.remaining, 1);
        assert!(!limiter.entries.get("k").unwrap().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = limiter(10);
        limiter.check("a");
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.check("b");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup() {
        let limiter = Arc::new(limiter(10));
        let sweeper = limiter.spawn_cleanup();
        limiter.check("a");

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(limiter.is_empty());
        sweeper.shutdown().await;
    }

    #[test]
    fn test_key_strategies() {
        let site = Site::new("s1", "acme");
        let mut config = RateLimitConfig::default();
        assert_eq!(RateLimiter::new(config.clone()).key_for(&site, "1.2.3.4"), "s1:1.2.3.4");
        config.key = KeyStrategy::Ip;
        assert_eq!(RateLimiter::new(config.clone()).key_for(&site, "1.2.3.4"), "ip:1.2.3.4");
        config.key = KeyStrategy::Site;
        assert_eq!(RateLimiter::new(config).key_for(&site, "1.2.3.4"), "site:s1");
    }

    #[test]
    fn test_client_ip_priority() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(client_ip(&headers), "203.0.113.9");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_ip(&headers), "198.51.100.7");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 192.0.2.1 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "192.0.2.1");

        // Garbage in the first header falls through to the next one.
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers), "198.51.100.7");
    }

    #[test]
    fn test_decision_headers() {
        let decision = RateLimitDecision {
            limited: true,
            limit: 100,
            remaining: 0,
            reset_after: Duration::from_millis(12_300),
            window: Duration::from_secs(60),
        };
        let headers = decision.headers();
        assert_eq!(headers[&LIMIT_HEADER], "100");
        assert_eq!(headers[&REMAINING_HEADER], "0");
        assert_eq!(headers[&WINDOW_HEADER], "60");
        assert_eq!(headers[RETRY_AFTER], "13");
    }
}
