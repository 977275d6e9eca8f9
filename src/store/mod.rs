//! Multi-source chapter store.
//!
//! This module provides SQLite-backed persistence for acquired chapters
//! with multi-source conflict resolution:
//!
//! - [`ChapterStore`] - durable, crash-consistent storage keyed by
//!   `(chapter_id, source_id)`
//! - [`ChapterRecord`] - the persisted unit
//! - [`SourceId`] / priority resolution via the shared
//!   [`SourceRegistry`](crate::source::SourceRegistry)
//!
//! The store is the single source of truth for "has this chapter already
//! been acquired". The scheduler never keeps its own completion ledger;
//! re-running an interrupted job simply re-enumerates chapters and skips
//! whatever `exists` reports as present.
//!
//! # Example
//!
//! ```ignore
//! use bookfetch_core::store::{ChapterStore, ChapterRecord, SourceId};
//!
//! let store = ChapterStore::new(db, registry);
//! store.upsert(&ChapterRecord::new("c1", SourceId(0), "Chapter 1", "...")).await?;
//! assert!(store.exists("c1", None).await?);
//! let best = store.get_best("c1").await?;
//! ```

mod error;
mod record;

pub use error::StoreError;
pub use record::{ChapterRange, ChapterRecord, ChapterRef, Item, SourceId};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Map;
use sqlx::FromRow;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::source::SourceRegistry;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One persisted row of the `chapters` table.
#[derive(Debug, Clone, FromRow)]
struct ChapterRow {
    chapter_id: String,
    source_id: i64,
    title: String,
    body: String,
    metadata: String,
}

impl ChapterRow {
    /// Parses the JSON metadata column into a domain record.
    fn into_record(self) -> Result<ChapterRecord> {
        let metadata: Map<String, serde_json::Value> =
            serde_json::from_str(&self.metadata).map_err(|source| StoreError::Metadata {
                chapter_id: self.chapter_id.clone(),
                source,
            })?;

        Ok(ChapterRecord {
            chapter_id: self.chapter_id,
            source_id: SourceId(self.source_id),
            title: self.title,
            body: self.body,
            metadata,
        })
    }
}

/// Durable store of chapter records with priority-based resolution.
///
/// Exclusively owns the persisted records: the scheduler and acquisition
/// tasks only read (`exists`, `get_best`) and write (`upsert`) through
/// this interface. Writes for the same key are serialized by SQLite;
/// each upsert is atomic, so a reader never observes a record mixing an
/// old title with a new body.
#[derive(Debug, Clone)]
pub struct ChapterStore {
    db: Database,
    registry: Arc<SourceRegistry>,
}

impl ChapterStore {
    /// Creates a store over the given database and source registry.
    ///
    /// The registry supplies the per-source priorities used by best-copy
    /// resolution; the store never persists priorities itself.
    #[must_use]
    pub fn new(db: Database, registry: Arc<SourceRegistry>) -> Self {
        Self { db, registry }
    }

    /// The registry this store resolves priorities against.
    #[must_use]
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Inserts or replaces the record for `(chapter_id, source_id)`.
    ///
    /// Idempotent: upserting identical content twice leaves the same
    /// state as once. Changed content replaces the prior row atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Metadata`] if the metadata map cannot be
    /// serialized, or [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, record), fields(chapter_id = %record.chapter_id, source = %record.source_id))]
    pub async fn upsert(&self, record: &ChapterRecord) -> Result<()> {
        let metadata = serialize_metadata(record)?;

        sqlx::query(UPSERT_SQL)
            .bind(&record.chapter_id)
            .bind(record.source_id.0)
            .bind(&record.title)
            .bind(&record.body)
            .bind(metadata)
            .execute(self.db.pool())
            .await?;

        debug!("chapter record upserted");
        Ok(())
    }

    /// Upserts a batch of records in one transaction.
    ///
    /// This is a commit-batching throughput optimization, not a
    /// consistency primitive: callers must not rely on all-or-nothing
    /// behavior across chapters. Each individual record's write remains
    /// atomic; a crash mid-batch loses only buffered records, never
    /// corrupts previously committed ones.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Metadata`] if any metadata map cannot be
    /// serialized, or [`StoreError::Database`] if a write fails.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn upsert_many(&self, records: &[ChapterRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.pool().begin().await?;

        for record in records {
            let metadata = serialize_metadata(record)?;
            sqlx::query(UPSERT_SQL)
                .bind(&record.chapter_id)
                .bind(record.source_id.0)
                .bind(&record.title)
                .bind(&record.body)
                .bind(metadata)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("batch committed");
        Ok(())
    }

    /// Checks whether a record exists.
    ///
    /// With a `source_id`, checks that exact pair; without, checks
    /// whether *any* source has a record for the chapter. Reflects all
    /// committed upserts, including ones from concurrent workers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn exists(&self, chapter_id: &str, source_id: Option<SourceId>) -> Result<bool> {
        let row: Option<(i64,)> = match source_id {
            Some(source) => {
                sqlx::query_as(
                    r"SELECT 1 FROM chapters WHERE chapter_id = ? AND source_id = ? LIMIT 1",
                )
                .bind(chapter_id)
                .bind(source.0)
                .fetch_optional(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as(r"SELECT 1 FROM chapters WHERE chapter_id = ? LIMIT 1")
                    .bind(chapter_id)
                    .fetch_optional(self.db.pool())
                    .await?
            }
        };

        Ok(row.is_some())
    }

    /// Checks whether the chapter is already satisfied at a priority
    /// level at least as good as `priority` (numerically lower or equal).
    ///
    /// Used by the scheduler's work-set computation: when fetching from
    /// a source of priority `p`, a chapter with an existing copy at or
    /// better than `p` is skipped. Records from unregistered sources
    /// never satisfy the check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn exists_at_or_better(&self, chapter_id: &str, priority: u32) -> Result<bool> {
        let rows: Vec<(i64,)> =
            sqlx::query_as(r"SELECT source_id FROM chapters WHERE chapter_id = ?")
                .bind(chapter_id)
                .fetch_all(self.db.pool())
                .await?;

        Ok(rows.iter().any(|(source_id,)| {
            self.registry
                .priority_of(SourceId(*source_id))
                .is_some_and(|p| p <= priority)
        }))
    }

    /// Fetches the record for an exact `(chapter_id, source_id)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails, or
    /// [`StoreError::Metadata`] if the stored metadata cannot be parsed.
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        chapter_id: &str,
        source_id: SourceId,
    ) -> Result<Option<ChapterRecord>> {
        let row = sqlx::query_as::<_, ChapterRow>(
            r"SELECT chapter_id, source_id, title, body, metadata
              FROM chapters
              WHERE chapter_id = ? AND source_id = ?",
        )
        .bind(chapter_id)
        .bind(source_id.0)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(ChapterRow::into_record).transpose()
    }

    /// Resolves the best copy of a chapter across all sources.
    ///
    /// "Best" is the record whose source has the numerically smallest
    /// configured priority; ties resolve to the earlier-registered
    /// source. Copies from unregistered sources rank last but are still
    /// returned when nothing better exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails, or
    /// [`StoreError::Metadata`] if the stored metadata cannot be parsed.
    #[instrument(skip(self))]
    pub async fn get_best(&self, chapter_id: &str) -> Result<Option<ChapterRecord>> {
        let rows = sqlx::query_as::<_, ChapterRow>(
            r"SELECT chapter_id, source_id, title, body, metadata
              FROM chapters
              WHERE chapter_id = ?",
        )
        .bind(chapter_id)
        .fetch_all(self.db.pool())
        .await?;

        self.best_of(rows)
    }

    /// Resolves the best copies for many chapters in one query.
    ///
    /// Returns a map from chapter id to its best record; chapters with
    /// no record are absent from the map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails, or
    /// [`StoreError::Metadata`] if any stored metadata cannot be parsed.
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    pub async fn get_best_many(
        &self,
        chapter_ids: &[String],
    ) -> Result<HashMap<String, ChapterRecord>> {
        if chapter_ids.is_empty() {
            return Ok(HashMap::new());
        }

        // Dynamic placeholder list; sqlite binds are positional.
        let placeholders = vec!["?"; chapter_ids.len()].join(", ");
        let sql = format!(
            "SELECT chapter_id, source_id, title, body, metadata
             FROM chapters
             WHERE chapter_id IN ({placeholders})"
        );

        let mut query = sqlx::query_as::<_, ChapterRow>(&sql);
        for chapter_id in chapter_ids {
            query = query.bind(chapter_id);
        }

        let rows = query.fetch_all(self.db.pool()).await?;

        // Group rows per chapter, then resolve each group.
        let mut grouped: HashMap<String, Vec<ChapterRow>> = HashMap::new();
        for row in rows {
            grouped.entry(row.chapter_id.clone()).or_default().push(row);
        }

        let mut best = HashMap::with_capacity(grouped.len());
        for (chapter_id, rows) in grouped {
            if let Some(record) = self.best_of(rows)? {
                best.insert(chapter_id, record);
            }
        }

        Ok(best)
    }

    /// Total number of distinct `(chapter_id, source_id)` pairs stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(r"SELECT COUNT(*) FROM chapters")
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.0)
    }

    /// Picks the best-ranked row from one chapter's copies.
    fn best_of(&self, rows: Vec<ChapterRow>) -> Result<Option<ChapterRecord>> {
        rows.into_iter()
            .min_by_key(|row| self.registry.rank(SourceId(row.source_id)))
            .map(ChapterRow::into_record)
            .transpose()
    }
}

/// Upsert statement shared by single and batched writes.
///
/// `ON CONFLICT .. DO UPDATE` replaces the row in place as one atomic
/// statement, preserving `created_at` from the original insert.
const UPSERT_SQL: &str = r"INSERT INTO chapters (chapter_id, source_id, title, body, metadata)
  VALUES (?, ?, ?, ?, ?)
  ON CONFLICT (chapter_id, source_id) DO UPDATE SET
      title = excluded.title,
      body = excluded.body,
      metadata = excluded.metadata,
      updated_at = datetime('now')";

/// Serializes a record's metadata map to its JSON column form.
fn serialize_metadata(record: &ChapterRecord) -> Result<String> {
    serde_json::to_string(&record.metadata).map_err(|source| StoreError::Metadata {
        chapter_id: record.chapter_id.clone(),
        source,
    })
}
