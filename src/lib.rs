//! Core library for concurrent acquisition of multi-chapter works.
//!
//! `bookfetch_core` drives the acquisition of textual works that are
//! split into many small per-chapter resources: enumerate the chapter
//! list, fetch chapters concurrently but politely, extract their
//! content through pluggable source adapters, and persist them durably
//! with multi-source conflict resolution.
//!
//! # Architecture
//!
//! - [`scheduler`] - the run loop: enumeration, skip pass, bounded
//!   worker dispatch, run reports
//! - [`fetch`] - transport seam, rate limiting, retry with backoff
//! - [`store`] - SQLite-backed chapter records with priority-based
//!   best-copy resolution
//! - [`source`] - the adapter trait and registry for site-specific
//!   collaborators
//! - [`cancel`] - cooperative cancellation token
//! - [`db`] - connection pool and migrations
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bookfetch_core::cancel::CancelToken;
//! use bookfetch_core::db::Database;
//! use bookfetch_core::fetch::{HttpTransport, RateLimiter, RetryPolicy};
//! use bookfetch_core::scheduler::{ScheduleConfig, Scheduler};
//! use bookfetch_core::source::{SourceAdapter, SourceRegistry};
//! use bookfetch_core::store::{ChapterStore, Item};
//!
//! # async fn example(adapter: Arc<dyn SourceAdapter>) -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(std::path::Path::new("chapters.db")).await?;
//!
//! let mut registry = SourceRegistry::new();
//! let source_id = registry.register(adapter, 1);
//!
//! let store = ChapterStore::new(db, Arc::new(registry));
//! let scheduler = Scheduler::new(
//!     store,
//!     Arc::new(HttpTransport::new()),
//!     Arc::new(RateLimiter::new(Duration::from_secs(1))),
//!     RetryPolicy::default(),
//!     ScheduleConfig::default(),
//! )?;
//!
//! let cancel = CancelToken::new();
//! let report = scheduler.run(&Item::new("book-42"), source_id, &cancel).await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cancel;
pub mod db;
pub mod fetch;
pub mod scheduler;
pub mod source;
pub mod store;

pub use cancel::CancelToken;
pub use db::Database;
pub use fetch::{FetchError, HttpTransport, RateLimiter, RetryPolicy, Transport};
pub use scheduler::{RunReport, ScheduleConfig, ScheduleError, Scheduler};
pub use source::{SourceAdapter, SourceRegistry};
pub use store::{ChapterRecord, ChapterStore, Item, SourceId};
