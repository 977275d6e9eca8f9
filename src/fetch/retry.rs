//! Retry logic with exponential backoff for transient fetch failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureKind`] types for
//! classifying fetch errors and determining retry behavior.
//!
//! # Overview
//!
//! When a fetch fails, the error is classified into a [`FailureKind`]:
//! - [`FailureKind::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureKind::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureKind::NeedsAuth`] - Authentication required for this source
//! - [`FailureKind::RateLimited`] - Server rate limiting (retries with backoff)
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure
//! kind and attempt count, calculating exponential backoff delays with
//! jitter. [`RetryPolicy::run`] drives an entire fallible operation to
//! completion under the policy; the lower-level [`RetryPolicy::should_retry`]
//! is for callers that own their retry loop.
//!
//! The policy itself performs no I/O and holds no shared mutable state:
//! it is reentrant, and `run`'s only side effects are invoking the passed
//! operation and sleeping between attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::cancel::CancelToken;

use super::error::FetchError;
use super::rate_limiter::parse_retry_after;

/// Default maximum attempts (including the initial attempt).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of fetch failure kinds.
///
/// Used to determine whether a failed fetch should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, malformed response.
    Permanent,

    /// Authentication or authorization required.
    ///
    /// Retrying without credentials would not help; the caller needs a
    /// session for this source.
    NeedsAuth,

    /// Server rate limiting (HTTP 429).
    ///
    /// Retries with backoff, honoring a Retry-After header when present.
    RateLimited,
}

impl FailureKind {
    /// Returns true if this kind of failure is worth retrying.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the fetch after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the fetch.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Terminal result of driving an operation under a [`RetryPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// All attempts failed with retryable errors; the last one is carried.
    #[error("retries exhausted after {attempts} attempts")]
    Exhausted {
        /// Total attempts made.
        attempts: u32,
        /// The last observed failure.
        #[source]
        source: FetchError,
    },

    /// A non-retryable failure; the operation was not re-attempted.
    #[error("permanent failure on attempt {attempts}")]
    Fatal {
        /// Total attempts made (1 unless earlier attempts were transient).
        attempts: u32,
        /// The failure that ended the operation.
        #[source]
        source: FetchError,
    },

    /// Cancellation was signalled during a backoff wait.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
        /// The failure that preceded the interrupted backoff.
        #[source]
        source: FetchError,
    },
}

impl RetryError {
    /// The underlying fetch error.
    #[must_use]
    pub fn fetch_error(&self) -> &FetchError {
        match self {
            Self::Exhausted { source, .. }
            | Self::Fatal { source, .. }
            | Self::Cancelled { source, .. } => source,
        }
    }

    /// Total attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
/// - `backoff_multiplier`: 2.0
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults, delays are approximately: 1s, 2s (before hitting max attempts).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for
    /// other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Drives `operation` to completion under this policy.
    ///
    /// The operation is invoked up to `max_attempts` times. Each failure
    /// is classified; retryable failures sleep an exponentially growing
    /// delay (or the server's Retry-After, when a rate-limit response
    /// supplies one) before the next attempt. Non-retryable failures
    /// return immediately as [`RetryError::Fatal`]. Cancellation wakes a
    /// backoff sleep early and returns [`RetryError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the terminal [`RetryError`] when the operation cannot be
    /// completed.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let kind = classify_error(&error);

            // A server-mandated Retry-After overrides our own backoff.
            let server_delay = if kind == FailureKind::RateLimited {
                retry_after_delay(&error)
            } else {
                None
            };

            match self.should_retry(kind, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let delay = server_delay.unwrap_or(backoff_delay);
                    debug!(
                        url = error.url(),
                        attempt = next_attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis(),
                        using_retry_after = server_delay.is_some(),
                        error = %error,
                        "retrying after failure"
                    );

                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                source: error,
                            });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url = error.url(), %reason, "not retrying");
                    return Err(if kind.is_retryable() {
                        RetryError::Exhausted {
                            attempts: attempt,
                            source: error,
                        }
                    } else {
                        RetryError::Fatal {
                            attempts: attempt,
                            source: error,
                        }
                    });
                }
            }
        }
    }

    /// Determines whether to retry a failed fetch.
    ///
    /// # Arguments
    ///
    /// * `kind` - Classification of the failure
    /// * `attempt` - The attempt number that just failed (1-indexed)
    ///
    /// # Returns
    ///
    /// A [`RetryDecision`] indicating whether to retry and with what delay.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        match kind {
            FailureKind::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureKind::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required - retry without a session would not help"
                        .to_string(),
                };
            }
            FailureKind::Transient | FailureKind::RateLimited => {
                // Retryable, continue to attempt check
            }
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with exponential backoff and jitter.
    ///
    /// Formula: `min(base_delay * multiplier^(attempt - 1), max_delay) + jitter`
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 1-indexed; attempt 1 gets 1x base
        let exponent = f64::from(attempt - 1);
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = self.calculate_jitter();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = Duration::from_millis(capped_ms as u64);
        capped + jitter
    }

    /// Generates random jitter between 0 and `MAX_JITTER`.
    ///
    /// Jitter prevents thundering herd when multiple fetches fail
    /// simultaneously and would otherwise retry at the same instant.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Extracts a parsed Retry-After delay from a rate-limit error, if any.
fn retry_after_delay(error: &FetchError) -> Option<Duration> {
    match error {
        FetchError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

/// Classifies a fetch error into a failure kind for retry decisions.
///
/// # HTTP Status Code Classification
///
/// | Status | Kind | Rationale |
/// |--------|------|-----------|
/// | 400 | Permanent | Bad request - won't succeed on retry |
/// | 401 | NeedsAuth | Unauthorized - needs authentication |
/// | 403 | NeedsAuth | Forbidden - needs authentication |
/// | 404 | Permanent | Not found - chapter doesn't exist |
/// | 408 | Transient | Request timeout - may succeed |
/// | 410 | Permanent | Gone - permanently removed |
/// | 429 | RateLimited | Rate limited - retry with backoff |
/// | 451 | Permanent | Legal block - won't succeed |
/// | 500 | Transient | Server error - may be temporary |
/// | 502 | Transient | Bad gateway - proxy issue |
/// | 503 | Transient | Service unavailable - temporary |
/// | 504 | Transient | Gateway timeout - temporary |
///
/// # Non-HTTP Errors
///
/// | Error | Kind | Rationale |
/// |-------|------|-----------|
/// | Timeout | Transient | Network may recover |
/// | Network (most) | Transient | Server may come back |
/// | Network (TLS) | Permanent | Certificate/config issue |
/// | InvalidUrl | Permanent | Won't succeed |
/// | Malformed | Permanent | Refetching returns the same bytes |
#[instrument]
pub fn classify_error(error: &FetchError) -> FailureKind {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),

        FetchError::Timeout { .. } => FailureKind::Transient,

        FetchError::Network { source, .. } => {
            // TLS/certificate errors are configuration problems, permanent
            if is_tls_error(source) {
                FailureKind::Permanent
            } else {
                FailureKind::Transient
            }
        }

        FetchError::InvalidUrl { .. } | FetchError::Malformed { .. } => FailureKind::Permanent,
    }
}

/// Classifies an HTTP status code into a failure kind.
///
/// Explicit match arms are used for each status code for documentation
/// purposes, even though some return the same value.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureKind {
    match status {
        // Client errors - mostly permanent
        400 => FailureKind::Permanent,   // Bad Request
        401 => FailureKind::NeedsAuth,   // Unauthorized
        403 => FailureKind::NeedsAuth,   // Forbidden
        404 => FailureKind::Permanent,   // Not Found
        408 => FailureKind::Transient,   // Request Timeout
        410 => FailureKind::Permanent,   // Gone
        429 => FailureKind::RateLimited, // Too Many Requests
        451 => FailureKind::Permanent,   // Unavailable For Legal Reasons

        // Server errors - transient
        500 => FailureKind::Transient, // Internal Server Error
        502 => FailureKind::Transient, // Bad Gateway
        503 => FailureKind::Transient, // Service Unavailable
        504 => FailureKind::Transient, // Gateway Timeout

        // Other 4xx are generally permanent
        status if (400..500).contains(&status) => FailureKind::Permanent,

        // Other 5xx are generally transient
        status if (500..600).contains(&status) => FailureKind::Transient,

        // Anything else is unexpected, treat as permanent
        _ => FailureKind::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
