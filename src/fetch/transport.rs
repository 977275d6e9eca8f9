//! HTTP transport for fetching raw chapter content.
//!
//! This module defines the [`Transport`] trait - the narrow seam through
//! which the acquisition core issues requests - and [`HttpTransport`],
//! the reqwest-backed implementation with per-call timeouts and optional
//! cookie-jar session persistence for authenticated sources.
//!
//! The transport returns raw bytes or a classified [`FetchError`]; retry
//! decisions are made above it (see [`crate::fetch::RetryPolicy`]), and
//! politeness delays before it (see [`crate::fetch::RateLimiter`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, instrument};

use super::error::FetchError;

/// Default connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request timeout in seconds.
///
/// Chapter pages are small; a request that takes longer than this is
/// treated as a transient timeout and handed to the retry policy.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// User-Agent sent with every request.
const USER_AGENT: &str = concat!("bookfetch/", env!("CARGO_PKG_VERSION"));

/// Abstracted request issuer for the acquisition core.
///
/// Implementations must surface enough error detail for the retry policy
/// to distinguish transient failures (timeout, 5xx, connection reset)
/// from permanent ones (404, 401/403, malformed responses).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a GET request and returns the raw response body.
    ///
    /// # Errors
    ///
    /// Returns a classified [`FetchError`] on any failure, including
    /// non-success HTTP status codes.
    async fn request(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Reqwest-backed [`Transport`] with connection pooling.
///
/// Designed to be created once per run and shared across acquisition
/// tasks; cloning shares the underlying connection pool.
///
/// # Example
///
/// ```no_run
/// use bookfetch_core::fetch::{HttpTransport, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = HttpTransport::new();
/// let bytes = transport.request("https://example.com/book/1/chapter/1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates a transport with default timeouts and no cookie jar.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = build_client(None, Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Creates a transport with an explicit per-request timeout.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the supplied
    /// configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeout(request_timeout: Duration) -> Self {
        let client = build_client(None, request_timeout)
            .expect("failed to build HTTP client with supplied timeout");
        Self { client }
    }

    /// Creates a transport with a cookie jar for authenticated sources.
    ///
    /// Cookies in the jar are attached to matching requests by domain,
    /// path and secure flag, and persist across requests for the life of
    /// this transport - the session survives the whole run.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    #[instrument(level = "debug", skip(cookie_jar))]
    pub fn with_cookie_jar(cookie_jar: Arc<Jar>) -> Self {
        let client = build_client(
            Some(cookie_jar),
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
        .expect("failed to build HTTP client with static configuration");
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self), fields(url = %url))]
    async fn request(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        // Validate eagerly so garbage URLs classify as permanent instead
        // of surfacing as an opaque reqwest builder error.
        if url::Url::parse(url).is_err() {
            return Err(FetchError::invalid_url(url));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            debug!(status = status.as_u16(), ?retry_after, "non-success status");
            return Err(FetchError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        debug!(len = bytes.len(), "fetched response body");
        Ok(bytes.to_vec())
    }
}

/// Maps a reqwest error to a [`FetchError`], separating timeouts from
/// other network failures so they classify as transient.
fn map_reqwest_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error)
    }
}

/// Builds the shared reqwest client.
fn build_client(
    cookie_jar: Option<Arc<Jar>>,
    request_timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let mut builder = ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(request_timeout)
        .gzip(true);

    if let Some(jar) = cookie_jar {
        builder = builder.cookie_provider(jar);
    }

    builder.build()
}
