//! Politeness rate limiting for chapter requests.
//!
//! This module provides the [`RateLimiter`] struct which composes two
//! independent admission policies:
//!
//! - a minimum delay between requests sharing the same *source key*
//!   (so two items being fetched from the same site still throttle
//!   jointly), and
//! - an optional global ceiling on requests per second across all keys.
//!
//! `acquire` only ever delays; it has no error conditions. Callers from
//! many concurrent tasks are admitted in roughly FIFO order because both
//! policies serialize through a `tokio::sync::Mutex`, whose waiters are
//! queued fairly.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bookfetch_core::fetch::RateLimiter;
//!
//! # async fn example() {
//! // One request per second per source
//! let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1)));
//!
//! // First request proceeds immediately
//! limiter.acquire("novelsite").await;
//!
//! // Second request to the same source waits for the delay
//! limiter.acquire("novelsite").await;
//!
//! // Request against a different source proceeds immediately
//! limiter.acquire("mirror").await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative delay per source key (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Shared rate limiter for chapter requests.
///
/// Designed to be wrapped in `Arc` and shared across acquisition tasks.
/// Uses `DashMap` for lock-free access to per-key state and a
/// `tokio::sync::Mutex` per key for atomic read-update on timing.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum delay between requests sharing a source key.
    per_source_delay: Duration,

    /// Whether rate limiting is disabled entirely.
    disabled: bool,

    /// Optional global ceiling, expressed as a minimum spacing between
    /// any two requests regardless of source key.
    global: Option<GlobalCeiling>,

    /// Per-source-key state tracking.
    /// Uses Arc so the state can be cloned out and the `DashMap` shard
    /// lock released before awaiting on the inner Mutex.
    sources: DashMap<String, Arc<SourceState>>,
}

/// Global requests-per-second ceiling state.
#[derive(Debug)]
struct GlobalCeiling {
    /// Minimum interval between any two requests (1 / max_rps).
    interval: Duration,
    /// The earliest instant the next request may start.
    /// `None` until the first request goes out.
    next_slot: Mutex<Option<Instant>>,
}

impl GlobalCeiling {
    /// Reserves the next admission slot, returning how long to wait.
    ///
    /// The lock is held only to compute and advance the slot; the sleep
    /// itself happens outside so waiters queue fairly without holding it.
    async fn reserve(&self) -> Duration {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        match *next {
            Some(slot) if slot > now => {
                *next = Some(slot + self.interval);
                slot - now
            }
            _ => {
                *next = Some(now + self.interval);
                Duration::ZERO
            }
        }
    }
}

/// State tracked for each source key.
#[derive(Debug)]
struct SourceState {
    /// Time of the last request for this key.
    /// `None` indicates no request has gone out yet (first is immediate).
    last_request: Mutex<Option<Instant>>,

    /// Cumulative delay applied to this key (in milliseconds).
    /// Used to warn when excessive rate limiting occurs.
    cumulative_delay_ms: AtomicU64,
}

impl SourceState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Adds to the cumulative delay and returns the new total.
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a rate limiter with the specified per-source delay and no
    /// global ceiling.
    #[must_use]
    #[instrument(skip_all, fields(delay_ms = per_source_delay.as_millis()))]
    pub fn new(per_source_delay: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            per_source_delay,
            disabled: false,
            global: None,
            sources: DashMap::new(),
        }
    }

    /// Creates a rate limiter with a per-source delay and a global
    /// requests-per-second ceiling shared across all source keys.
    ///
    /// A `max_rps` of zero disables the global ceiling.
    #[must_use]
    #[instrument(skip_all, fields(delay_ms = per_source_delay.as_millis(), max_rps))]
    pub fn with_global_limit(per_source_delay: Duration, max_rps: f64) -> Self {
        let global = if max_rps > 0.0 {
            Some(GlobalCeiling {
                interval: Duration::from_secs_f64(1.0 / max_rps),
                next_slot: Mutex::new(None),
            })
        } else {
            None
        };

        debug!(global = global.is_some(), "creating rate limiter");
        Self {
            per_source_delay,
            disabled: false,
            global,
            sources: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no delays.
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            per_source_delay: Duration::ZERO,
            disabled: true,
            global: None,
            sources: DashMap::new(),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the per-source delay between requests.
    #[must_use]
    pub fn per_source_delay(&self) -> Duration {
        self.per_source_delay
    }

    /// Acquires permission to issue the next request for `source_key`.
    ///
    /// Suspends the caller until both policies admit it:
    /// 1. the global requests-per-second ceiling (if configured), then
    /// 2. the per-source minimum interval.
    ///
    /// The first request for any key proceeds without a per-source delay.
    #[instrument(skip(self))]
    pub async fn acquire(&self, source_key: &str) {
        if self.disabled {
            return;
        }

        // Global ceiling first, so per-source spacing is measured from
        // the moment the request is actually allowed to go out.
        if let Some(global) = &self.global {
            let wait = global.reserve().await;
            if wait > Duration::ZERO {
                debug!(wait_ms = wait.as_millis(), "waiting on global ceiling");
                tokio::time::sleep(wait).await;
            }
        }

        // Get or create source state, clone Arc to release the DashMap
        // shard lock before awaiting.
        let state = self
            .sources
            .entry(source_key.to_string())
            .or_insert_with(|| Arc::new(SourceState::new()))
            .clone();

        // Lock the state to atomically check and update timing.
        let mut last_request_guard = state.last_request.lock().await;

        if let Some(last_request) = *last_request_guard {
            let elapsed = last_request.elapsed();

            if elapsed < self.per_source_delay {
                let delay = self.per_source_delay.saturating_sub(elapsed);
                let cumulative = state.add_cumulative_delay(delay);

                debug!(
                    source_key,
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying rate limit delay"
                );

                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        source_key,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive rate limiting - consider reducing request volume to this source"
                    );
                }

                tokio::time::sleep(delay).await;
            }
        } else {
            debug!(source_key, "first request for source - no delay");
        }

        // Update last request time after any delay
        *last_request_guard = Some(Instant::now());
    }

    /// Records a server-mandated rate limit delay (from Retry-After).
    ///
    /// This feeds the cumulative accounting for the key so operators get
    /// warned when a server is pushing back hard; the actual delay is
    /// applied by the retry loop that observed the response.
    #[instrument(skip(self))]
    pub fn record_rate_limit(&self, source_key: &str, delay: Duration) {
        let state = self
            .sources
            .entry(source_key.to_string())
            .or_insert_with(|| Arc::new(SourceState::new()));
        let cumulative = state.add_cumulative_delay(delay);

        debug!(
            source_key,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );

        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                source_key,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - source may be under heavy load"
            );
        }
    }
}

/// Derives a throttle key from a URL.
///
/// Adapters typically declare a fixed throttle key, but ad-hoc callers
/// can throttle by host. Returns "unknown" for malformed URLs, ensuring
/// such requests are still jointly rate limited.
///
/// # Examples
///
/// ```
/// use bookfetch_core::fetch::rate_limiter::throttle_key_from_url;
///
/// assert_eq!(throttle_key_from_url("https://example.com/ch/1"), "example.com");
/// assert_eq!(throttle_key_from_url("http://Example.COM/Path"), "example.com");
/// assert_eq!(throttle_key_from_url("not a url"), "unknown");
/// ```
#[must_use]
pub fn throttle_key_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2026 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values
/// at 1 hour.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    // Try parsing as integer seconds first (most common)
    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    // Try parsing as HTTP-date
    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            // Date is in the past
            debug!(
                header_value,
                "Retry-After date is in the past, returning zero"
            );
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RateLimiter Tests ====================

    #[test]
    fn test_rate_limiter_new_stores_delay() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        assert_eq!(limiter.per_source_delay(), Duration::from_millis(500));
        assert!(!limiter.is_disabled());
    }

    #[test]
    fn test_rate_limiter_disabled_has_zero_delay() {
        let limiter = RateLimiter::disabled();
        assert_eq!(limiter.per_source_delay(), Duration::ZERO);
        assert!(limiter.is_disabled());
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled_no_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::disabled();
        let start = Instant::now();

        limiter.acquire("a").await;
        limiter.acquire("a").await;
        limiter.acquire("a").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_first_request_no_delay() {
        tokio::time::pause();

        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire("novelsite").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_delays_same_source() {
        tokio::time::pause();

        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire("novelsite").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire("novelsite").await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));

        limiter.acquire("novelsite").await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rate_limiter_different_sources_independent() {
        tokio::time::pause();

        let limiter = RateLimiter::new(Duration::from_secs(1));

        let start = Instant::now();
        limiter.acquire("site-a").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        let start2 = Instant::now();
        limiter.acquire("site-b").await;
        assert!(start2.elapsed() < Duration::from_millis(10));

        let start3 = Instant::now();
        limiter.acquire("site-c").await;
        assert!(start3.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_rate_limiter_tracks_sources_independently() {
        tokio::time::pause();

        let limiter = RateLimiter::new(Duration::from_secs(1));

        limiter.acquire("a").await;
        limiter.acquire("b").await;

        let start_a = Instant::now();
        limiter.acquire("a").await;
        assert!(start_a.elapsed() >= Duration::from_millis(900));

        let start_b = Instant::now();
        limiter.acquire("b").await;
        // Part of b's interval already elapsed during a's wait
        assert!(start_b.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_rate_limiter_global_ceiling_spaces_all_keys() {
        tokio::time::pause();

        // No per-source delay, 2 requests/second globally
        let limiter = RateLimiter::with_global_limit(Duration::ZERO, 2.0);
        let start = Instant::now();

        limiter.acquire("a").await;
        limiter.acquire("b").await;
        limiter.acquire("c").await;

        // Third request must wait two 500ms slots
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_rate_limiter_global_ceiling_zero_rps_ignored() {
        tokio::time::pause();

        let limiter = RateLimiter::with_global_limit(Duration::ZERO, 0.0);
        let start = Instant::now();

        limiter.acquire("a").await;
        limiter.acquire("a").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    // ==================== throttle_key_from_url Tests ====================

    #[test]
    fn test_throttle_key_valid_https() {
        assert_eq!(
            throttle_key_from_url("https://example.com/ch/1"),
            "example.com"
        );
    }

    #[test]
    fn test_throttle_key_lowercase() {
        assert_eq!(
            throttle_key_from_url("https://Example.COM/Path"),
            "example.com"
        );
    }

    #[test]
    fn test_throttle_key_with_port() {
        assert_eq!(
            throttle_key_from_url("https://example.com:8080/path"),
            "example.com"
        );
    }

    #[test]
    fn test_throttle_key_malformed_url() {
        assert_eq!(throttle_key_from_url("not a valid url"), "unknown");
    }

    #[test]
    fn test_throttle_key_empty() {
        assert_eq!(throttle_key_from_url(""), "unknown");
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_zero() {
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("invalid"), None);
    }

    #[test]
    fn test_parse_retry_after_whitespace() {
        assert_eq!(parse_retry_after("  120  "), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let result = parse_retry_after(&future_date);
        assert!(result.is_some(), "Should parse future HTTP-date");

        let duration = result.unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Duration should be ~60s, got {duration:?}"
        );
    }

    // ==================== record_rate_limit Tests ====================

    #[test]
    fn test_record_rate_limit_tracks_cumulative() {
        let limiter = RateLimiter::new(Duration::from_secs(1));

        limiter.record_rate_limit("novelsite", Duration::from_secs(5));
        limiter.record_rate_limit("novelsite", Duration::from_secs(10));

        let state = limiter.sources.get("novelsite").unwrap();
        let cumulative = state.cumulative_delay_ms.load(Ordering::SeqCst);
        assert_eq!(cumulative, 15000);
    }

    #[test]
    fn test_record_rate_limit_keys_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(1));

        limiter.record_rate_limit("a", Duration::from_secs(5));
        limiter.record_rate_limit("b", Duration::from_secs(10));

        let state_a = limiter.sources.get("a").unwrap();
        let state_b = limiter.sources.get("b").unwrap();

        assert_eq!(state_a.cumulative_delay_ms.load(Ordering::SeqCst), 5000);
        assert_eq!(state_b.cumulative_delay_ms.load(Ordering::SeqCst), 10000);
    }
}
