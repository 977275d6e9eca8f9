//! Source adapters and the source registry.
//!
//! A *source* is one distinct origin for chapter content - for example a
//! free preview endpoint and an authenticated full-text endpoint of the
//! same site are two sources with different configured priorities. The
//! site-specific knowledge (how to list chapters, how to build a chapter
//! URL, how to turn raw bytes into text) lives behind the
//! [`SourceAdapter`] trait; the core never parses site markup itself.
//!
//! The [`SourceRegistry`] is built once at startup and passed by
//! reference into the scheduler and store - there is no ambient global
//! registry, so tests can substitute fake adapters freely.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::fetch::{FetchError, Transport};
use crate::store::{ChapterRef, SourceId};

/// Structured content extracted from one raw chapter response.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedChapter {
    /// Chapter title.
    pub title: String,
    /// Chapter body text.
    pub body: String,
    /// Open-ended metadata captured during extraction.
    pub metadata: Map<String, Value>,
}

impl ExtractedChapter {
    /// Creates an extracted chapter with empty metadata.
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            metadata: Map::new(),
        }
    }
}

/// Site-specific collaborator for one source of chapter content.
///
/// Implementations own all parsing, decryption and OCR concerns; the
/// acquisition core only sees chapter lists, URLs and extracted text.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Human-readable adapter name for logs and reports.
    fn name(&self) -> &str;

    /// Rate-limiting key. Sources backed by the same site should share a
    /// key so requests against them are throttled jointly.
    fn throttle_key(&self) -> &str;

    /// Resolves the ordered chapter list for an item.
    ///
    /// # Errors
    ///
    /// Returns a classified [`FetchError`] if the item cannot be located
    /// or its listing cannot be parsed ([`FetchError::Malformed`]).
    async fn fetch_chapter_list(
        &self,
        transport: &dyn Transport,
        item_id: &str,
    ) -> Result<Vec<ChapterRef>, FetchError>;

    /// Builds the URL for one chapter's raw content.
    fn chapter_url(&self, item_id: &str, chapter_id: &str) -> String;

    /// Turns raw response bytes into structured chapter content.
    ///
    /// Returns `None` when the content exists but cannot be made sense
    /// of (unrecognized layout, failed deobfuscation). The core treats
    /// that as a non-retryable extraction failure, distinct from any
    /// network failure.
    fn extract_chapter(&self, raw: &[u8], chapter_id: &str) -> Option<ExtractedChapter>;
}

/// One registered source: adapter plus configured priority.
pub struct RegisteredSource {
    /// Identifier assigned at registration (also the tie-break rank).
    pub id: SourceId,
    /// Configured preference; numerically lower is more preferred.
    pub priority: u32,
    adapter: Arc<dyn SourceAdapter>,
}

impl RegisteredSource {
    /// The adapter for this source.
    #[must_use]
    pub fn adapter(&self) -> &dyn SourceAdapter {
        self.adapter.as_ref()
    }

    /// Clones the adapter handle for use in a spawned task.
    #[must_use]
    pub fn adapter_handle(&self) -> Arc<dyn SourceAdapter> {
        Arc::clone(&self.adapter)
    }
}

impl fmt::Debug for RegisteredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSource")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// Explicit registry of sources, constructed at process start.
///
/// Registration order is load-bearing: it assigns [`SourceId`]s and
/// breaks priority ties deterministically (first registered wins).
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<RegisteredSource>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source adapter with its configured priority.
    ///
    /// Returns the assigned [`SourceId`]. Ids are assigned sequentially
    /// in registration order.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>, priority: u32) -> SourceId {
        let id = SourceId(self.sources.len() as i64);
        debug!(
            name = adapter.name(),
            priority,
            id = %id,
            "registering source"
        );
        self.sources.push(RegisteredSource {
            id,
            priority,
            adapter,
        });
        id
    }

    /// Looks up a registered source by id.
    #[must_use]
    pub fn get(&self, id: SourceId) -> Option<&RegisteredSource> {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.sources.get(index))
    }

    /// Returns the configured priority for a source, if registered.
    #[must_use]
    pub fn priority_of(&self, id: SourceId) -> Option<u32> {
        self.get(id).map(|s| s.priority)
    }

    /// Resolution rank for a source id: lower ranks are preferred.
    ///
    /// Registered sources rank by `(priority, registration order)`.
    /// Records from sources no longer registered rank after every
    /// registered one - surfaced last, never silently dropped.
    #[must_use]
    pub fn rank(&self, id: SourceId) -> (u32, i64) {
        match self.get(id) {
            Some(source) => (source.priority, source.id.0),
            None => (u32::MAX, id.0),
        }
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Iterates registered sources in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredSource> {
        self.sources.iter()
    }
}
