//! Per-chapter acquisition: fetch, retry, extract, persist.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::fetch::{
    FailureKind, FetchError, RateLimiter, RetryDecision, RetryPolicy, Transport, classify_error,
    parse_retry_after,
};
use crate::source::SourceAdapter;
use crate::store::{ChapterRecord, ChapterRef, ChapterStore, SourceId};

use super::report::{AcquisitionOutcome, ChapterFailure, FailureClass};

/// Everything one chapter acquisition needs, cheap to clone per worker.
///
/// Drives a single chapter from URL to persisted record. Owns its own
/// retry loop (rather than delegating to [`RetryPolicy::run`]) because
/// each attempt must pass through the rate limiter, and server-mandated
/// rate-limit delays must be fed back into the limiter's accounting.
#[derive(Clone)]
pub(crate) struct AcquisitionTask {
    pub store: ChapterStore,
    pub transport: Arc<dyn Transport>,
    pub rate_limiter: Arc<RateLimiter>,
    pub retry_policy: RetryPolicy,
    pub adapter: Arc<dyn SourceAdapter>,
    pub source_id: SourceId,
    pub item_id: String,
    pub cancel: CancelToken,
}

impl AcquisitionTask {
    /// Acquires one chapter end to end.
    ///
    /// Returns `None` when cancellation interrupted the task before a
    /// terminal outcome; the chapter is then neither settled nor failed,
    /// and a later run will pick it up again.
    #[instrument(skip(self, chapter), fields(item = %self.item_id, chapter = %chapter.id, source = %self.source_id))]
    pub async fn acquire(&self, chapter: &ChapterRef) -> Option<AcquisitionOutcome> {
        let url = self.adapter.chapter_url(&self.item_id, &chapter.id);

        let raw = match self.fetch_with_retries(chapter, &url).await? {
            Ok(bytes) => bytes,
            Err(failure) => return Some(AcquisitionOutcome::Failed(failure)),
        };

        let Some(extracted) = self.adapter.extract_chapter(&raw, &chapter.id) else {
            warn!(url, "adapter could not extract chapter content");
            return Some(AcquisitionOutcome::Failed(ChapterFailure {
                chapter_id: chapter.id.clone(),
                class: FailureClass::Extraction,
                message: format!("content at {url} could not be extracted"),
                attempts: 0,
            }));
        };

        let record = ChapterRecord::new(&chapter.id, self.source_id, extracted.title, extracted.body)
            .with_metadata(extracted.metadata);

        // A store failure is an escalation, never silently swallowed as
        // a fetch problem.
        if let Err(error) = self.store.upsert(&record).await {
            warn!(chapter = %chapter.id, %error, "failed to persist acquired chapter");
            return Some(AcquisitionOutcome::Failed(ChapterFailure {
                chapter_id: chapter.id.clone(),
                class: FailureClass::Store,
                message: error.to_string(),
                attempts: 0,
            }));
        }

        debug!(chapter = %chapter.id, "chapter acquired");
        Some(AcquisitionOutcome::Acquired)
    }

    /// Fetches the chapter bytes under the retry policy.
    ///
    /// Every attempt, including retries, waits its turn at the rate
    /// limiter first. Returns `None` on cancellation, `Some(Err(_))`
    /// with the terminal failure when attempts are exhausted or the
    /// failure is not retryable.
    async fn fetch_with_retries(
        &self,
        chapter: &ChapterRef,
        url: &str,
    ) -> Option<Result<Vec<u8>, ChapterFailure>> {
        let throttle_key = self.adapter.throttle_key();
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                debug!(url, "cancelled before attempt");
                return None;
            }

            self.rate_limiter.acquire(throttle_key).await;
            attempt += 1;

            let error = match self.transport.request(url).await {
                Ok(bytes) => return Some(Ok(bytes)),
                Err(error) => error,
            };

            let kind = classify_error(&error);

            // Feed server pushback into the limiter's accounting and
            // prefer the server's delay over our own backoff.
            let server_delay = if kind == FailureKind::RateLimited {
                let delay = retry_after_of(&error);
                if let Some(delay) = delay {
                    self.rate_limiter.record_rate_limit(throttle_key, delay);
                }
                delay
            } else {
                None
            };

            match self.retry_policy.should_retry(kind, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let delay = server_delay.unwrap_or(backoff_delay);
                    debug!(
                        url,
                        attempt = next_attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying chapter fetch"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            debug!(url, "cancelled during backoff");
                            return None;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, %reason, "giving up on chapter fetch");
                    return Some(Err(ChapterFailure {
                        chapter_id: chapter.id.clone(),
                        class: FailureClass::from_failure_kind(kind),
                        message: error.to_string(),
                        attempts: attempt,
                    }));
                }
            }
        }
    }
}

/// Parsed Retry-After delay carried on a rate-limit response, if any.
fn retry_after_of(error: &FetchError) -> Option<Duration> {
    match error {
        FetchError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}
