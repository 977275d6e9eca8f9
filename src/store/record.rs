//! Domain types for items, chapters and persisted chapter records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies a registered source of chapter content.
///
/// Assigned by the [`crate::source::SourceRegistry`] in registration
/// order, which doubles as the deterministic tie-break when two sources
/// share the same configured priority (first registered wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Reference to one chapter within an item's ordered sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    /// Opaque chapter identifier, unique within the item.
    pub id: String,
    /// Position in the item's reading order (1-based). Used for ordering
    /// and range restriction only, never for uniqueness.
    pub position: usize,
}

impl ChapterRef {
    /// Creates a chapter reference.
    #[must_use]
    pub fn new(id: impl Into<String>, position: usize) -> Self {
        Self {
            id: id.into(),
            position,
        }
    }
}

/// Caller-supplied restriction on which chapter positions to acquire.
///
/// Positions are 1-based and inclusive on both ends. The default admits
/// every chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterRange {
    /// First admitted position, if bounded below.
    pub start: Option<usize>,
    /// Last admitted position, if bounded above.
    pub end: Option<usize>,
    /// Positions excluded regardless of the bounds.
    pub ignore: BTreeSet<usize>,
}

impl ChapterRange {
    /// A range admitting every chapter.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A bounded range `[start, end]` (either bound optional).
    #[must_use]
    pub fn bounded(start: Option<usize>, end: Option<usize>) -> Self {
        Self {
            start,
            end,
            ignore: BTreeSet::new(),
        }
    }

    /// Adds positions to the ignore set.
    #[must_use]
    pub fn ignoring(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.ignore.extend(positions);
        self
    }

    /// Returns true if the given position survives this restriction.
    #[must_use]
    pub fn admits(&self, position: usize) -> bool {
        if let Some(start) = self.start {
            if position < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if position > end {
                return false;
            }
        }
        !self.ignore.contains(&position)
    }
}

/// A logical multi-chapter work being acquired.
///
/// Immutable for the duration of one scheduler run. The chapter list is
/// either a previously-fetched snapshot carried on the item, or resolved
/// during enumeration through the item's source adapter.
#[derive(Debug, Clone)]
pub struct Item {
    /// Opaque identifier within the source's namespace.
    pub id: String,
    /// Pre-fetched chapter list, when the caller already has one.
    /// `None` means the scheduler enumerates via the source adapter.
    pub chapters: Option<Vec<ChapterRef>>,
    /// Restriction on which chapter positions to acquire.
    pub range: ChapterRange,
}

impl Item {
    /// Creates an item whose chapter list will be enumerated at run time.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chapters: None,
            range: ChapterRange::all(),
        }
    }

    /// Attaches a previously-fetched chapter list snapshot.
    #[must_use]
    pub fn with_snapshot(mut self, chapters: Vec<ChapterRef>) -> Self {
        self.chapters = Some(chapters);
        self
    }

    /// Applies a chapter-range restriction.
    #[must_use]
    pub fn with_range(mut self, range: ChapterRange) -> Self {
        self.range = range;
        self
    }
}

/// The persisted unit: one copy of one chapter from one source.
///
/// At most one record exists per `(chapter_id, source_id)` pair; an
/// upsert with the same key replaces the previous copy in place. The
/// preference order among copies of the same chapter comes from the
/// source registry's configured priorities, never from the record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterRecord {
    /// Chapter identifier, unique within the item.
    pub chapter_id: String,
    /// Which registered source this copy came from.
    pub source_id: SourceId,
    /// Chapter title.
    pub title: String,
    /// Chapter body text.
    pub body: String,
    /// Open-ended metadata (word count, original update timestamp,
    /// embedded resource references, ...).
    pub metadata: Map<String, Value>,
}

impl ChapterRecord {
    /// Creates a record with empty metadata.
    #[must_use]
    pub fn new(
        chapter_id: impl Into<String>,
        source_id: SourceId,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            source_id,
            title: title.into(),
            body: body.into(),
            metadata: Map::new(),
        }
    }

    /// Replaces the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Inserts a single metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl fmt::Display for ChapterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChapterRecord {{ chapter: {}, source: {}, title: {} }}",
            self.chapter_id, self.source_id, self.title
        )
    }
}
