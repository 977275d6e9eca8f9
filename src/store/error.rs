//! Error types for the chapter store.

use thiserror::Error;

/// Errors from chapter store operations.
///
/// A store failure is escalated, never swallowed: the scheduler reports
/// it as a run-level warning and must not confuse it with a chapter
/// simply being absent.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The persistence substrate rejected an operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A record's metadata map could not be serialized or parsed.
    #[error("metadata serialization error for chapter {chapter_id}: {source}")]
    Metadata {
        /// The chapter whose metadata failed to round-trip.
        chapter_id: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}
