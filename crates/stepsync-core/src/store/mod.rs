//! Bucket persistence.
//!
//! The reconciliation pipeline relies on a single merge rule: a bucket's
//! stored count only ever moves up. [`BucketStore::upsert`] applies
//! `max(existing, new)` atomically per key, which makes re-running the
//! pipeline over the same input a no-op and lets the phone path and the coarse
//! path write concurrently without external locking.
//!
//! # Example
//!
//! ```rust
//! use stepsync_core::store::{BucketQuery, BucketStore, SqliteBucketStore};
//!
//! # fn example() -> Result<(), stepsync_core::store::StoreError> {
//! let store = SqliteBucketStore::in_memory()?;
//! store.upsert(1_700_000_010, 1_700_000_040, 42, None)?;
//! store.upsert(1_700_000_010, 1_700_000_040, 17, None)?;
//!
//! let buckets = store.query(&BucketQuery::default())?;
//! assert_eq!(buckets[0].steps, 42);
//! # Ok(())
//! # }
//! ```

mod sqlite;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteBucketStore;

/// Errors that can occur during bucket store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while opening the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Provenance could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A stored bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start, epoch seconds.
    pub start: u64,
    /// Bucket end, epoch seconds.
    pub end: u64,
    /// Step count.
    pub steps: u64,
    /// Serialized provenance of coarse reports that filled this bucket.
    pub provenance: Option<String>,
    /// Last time `steps` increased, epoch milliseconds.
    pub modified_at_ms: u64,
}

/// Filters for [`BucketStore::query`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketQuery {
    /// Only buckets with `start >= since_start`.
    pub since_start: Option<u64>,
    /// Only buckets with `modified_at_ms > modified_after_ms`.
    pub modified_after_ms: Option<u64>,
}

impl BucketQuery {
    /// Restricts to buckets starting at or after `start`.
    #[must_use]
    pub const fn since(mut self, start: u64) -> Self {
        self.since_start = Some(start);
        self
    }

    /// Restricts to buckets modified strictly after `at_ms`.
    #[must_use]
    pub const fn modified_after(mut self, at_ms: u64) -> Self {
        self.modified_after_ms = Some(at_ms);
        self
    }
}

/// Persistence contract required by the reconciliation pipeline.
pub trait BucketStore: Send + Sync {
    /// Merges `steps` into the bucket at `start`.
    ///
    /// The stored count becomes `max(existing, steps)`. Provenance is replaced
    /// only when `provenance` is `Some`. The modification time advances only
    /// when the count increases. Returns `true` if the count increased.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; the bucket is left unchanged.
    fn upsert(
        &self,
        start: u64,
        end: u64,
        steps: u64,
        provenance: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Returns buckets matching `query`, ascending by start.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn query(&self, query: &BucketQuery) -> Result<Vec<Bucket>, StoreError>;

    /// Returns buckets with `start` in `[from, to)`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn range(&self, from: u64, to: u64) -> Result<Vec<Bucket>, StoreError>;

    /// Deletes buckets starting strictly before `start`. Returns the number
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    fn prune_before(&self, start: u64) -> Result<usize, StoreError>;

    /// Returns the stored counts for `[from, to)` keyed by bucket start.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn counts(&self, from: u64, to: u64) -> Result<BTreeMap<u64, u64>, StoreError> {
        Ok(self
            .range(from, to)?
            .into_iter()
            .map(|b| (b.start, b.steps))
            .collect())
    }
}
