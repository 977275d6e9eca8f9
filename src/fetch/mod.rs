//! Polite, fault-tolerant fetching of raw chapter content.
//!
//! This module provides the transport seam and the two policies that
//! wrap every network call the acquisition core makes:
//!
//! - [`Transport`] / [`HttpTransport`] - issue a request, get raw bytes
//!   or a classified failure
//! - [`RateLimiter`] - per-source spacing plus an optional global
//!   requests-per-second ceiling
//! - [`RetryPolicy`] - bounded retries with exponential backoff on
//!   transient failures
//!
//! # Example
//!
//! ```no_run
//! use bookfetch_core::cancel::CancelToken;
//! use bookfetch_core::fetch::{HttpTransport, RateLimiter, RetryPolicy, Transport};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new();
//! let limiter = RateLimiter::new(Duration::from_millis(1000));
//! let policy = RetryPolicy::default();
//! let cancel = CancelToken::new();
//!
//! limiter.acquire("novelsite").await;
//! let bytes = policy
//!     .run(&cancel, || transport.request("https://example.com/book/1/chapter/1"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod rate_limiter;
mod retry;
mod transport;

pub use error::FetchError;
pub use rate_limiter::{RateLimiter, parse_retry_after, throttle_key_from_url};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureKind, RetryDecision, RetryError, RetryPolicy, classify_error,
};
pub use transport::{HttpTransport, Transport};
