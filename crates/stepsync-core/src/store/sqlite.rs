//! `SQLite`-backed bucket store.

// SQLite stores integers as i64; bucket starts and millisecond timestamps are
// always non-negative and far below i64::MAX. Counts are clamped on write.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};

use super::{Bucket, BucketQuery, BucketStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Schema for bucket storage.
const BUCKET_SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS buckets (
    start_secs INTEGER PRIMARY KEY,
    end_secs INTEGER NOT NULL,
    steps INTEGER NOT NULL CHECK (steps >= 0),
    provenance TEXT,
    modified_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_buckets_modified
    ON buckets(modified_at_ms);
";

/// Monotonic merge. Every expression on the right-hand side of `SET` sees the
/// pre-update row, so the `CASE` compares against the old count.
const UPSERT_SQL: &str = "
INSERT INTO buckets (start_secs, end_secs, steps, provenance, modified_at_ms)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(start_secs) DO UPDATE SET
    end_secs = excluded.end_secs,
    provenance = COALESCE(excluded.provenance, buckets.provenance),
    modified_at_ms = CASE
        WHEN excluded.steps > buckets.steps THEN excluded.modified_at_ms
        ELSE buckets.modified_at_ms
    END,
    steps = MAX(buckets.steps, excluded.steps)";

const SELECT_COLUMNS: &str = "SELECT start_secs, end_secs, steps, provenance, modified_at_ms FROM buckets";

/// Bucket store backed by a single `SQLite` database in WAL mode.
///
/// The connection is shared behind a mutex; each upsert runs inside its own
/// transaction so the read of the previous count and the merge are atomic.
pub struct SqliteBucketStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBucketStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl SqliteBucketStore {
    /// Opens or creates a bucket store at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;
        tracing::debug!(path = %path.display(), "opened bucket store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Creates an in-memory bucket store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock used for modification timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(BUCKET_SCHEMA)?;
        Ok(())
    }

    /// Returns the bucket at `start`, if stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, start: u64) -> Result<Option<Bucket>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let bucket = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE start_secs = ?1"),
                params![start as i64],
                bucket_from_row,
            )
            .optional()?;
        Ok(bucket)
    }

    /// Returns the total of all stored steps in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn total_steps(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(steps), 0) FROM buckets WHERE start_secs >= ?1 AND start_secs < ?2",
            params![from as i64, to as i64],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }
}

impl BucketStore for SqliteBucketStore {
    fn upsert(
        &self,
        start: u64,
        end: u64,
        steps: u64,
        provenance: Option<&str>,
    ) -> Result<bool, StoreError> {
        let steps = i64::try_from(steps).unwrap_or(i64::MAX);
        let now_ms = self.clock.now_ms();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT steps FROM buckets WHERE start_secs = ?1",
                params![start as i64],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            UPSERT_SQL,
            params![
                start as i64,
                end as i64,
                steps,
                provenance,
                now_ms as i64
            ],
        )?;
        tx.commit()?;

        Ok(previous.is_none_or(|p| steps > p))
    }

    fn query(&self, query: &BucketQuery) -> Result<Vec<Bucket>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE (?1 IS NULL OR start_secs >= ?1)
               AND (?2 IS NULL OR modified_at_ms > ?2)
             ORDER BY start_secs ASC"
        ))?;

        let buckets = stmt
            .query_map(
                params![
                    query.since_start.map(|s| s as i64),
                    query.modified_after_ms.map(|m| m as i64)
                ],
                bucket_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    fn range(&self, from: u64, to: u64) -> Result<Vec<Bucket>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE start_secs >= ?1 AND start_secs < ?2
             ORDER BY start_secs ASC"
        ))?;

        let buckets = stmt
            .query_map(params![from as i64, to as i64], bucket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }

    fn prune_before(&self, start: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM buckets WHERE start_secs < ?1",
            params![start as i64],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, before = start, "pruned buckets");
        }
        Ok(deleted)
    }
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<Bucket> {
    Ok(Bucket {
        start: row.get::<_, i64>(0)? as u64,
        end: row.get::<_, i64>(1)? as u64,
        steps: row.get::<_, i64>(2)? as u64,
        provenance: row.get(3)?,
        modified_at_ms: row.get::<_, i64>(4)? as u64,
    })
}
