//! File-backed source adapters.
//!
//! - [`FileCounterSensor`] reads a decimal counter value written by the
//!   platform's step sensor bridge.
//! - [`JsonlFeedSource`] tails an append-only JSON-lines file of
//!   [`ExternalRecord`]s exported from the companion data store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stepsync_core::ExternalRecord;
use tracing::{debug, warn};

use crate::source::{CoarseSource, CounterSensor, Cursor, PollResult, SourceError};

// =============================================================================
// FileCounterSensor
// =============================================================================

/// Reads the cumulative counter from a file holding one decimal integer.
///
/// A missing or empty file means the sensor has not reported yet.
#[derive(Debug, Clone)]
pub struct FileCounterSensor {
    path: PathBuf,
}

impl FileCounterSensor {
    /// Creates a sensor reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CounterSensor for FileCounterSensor {
    fn latest(&self) -> Result<Option<u64>, SourceError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|e| SourceError::Parse {
                what: "step counter",
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// JsonlFeedSource
// =============================================================================

/// Tails a JSON-lines feed of coarse reports.
///
/// The cursor is the byte offset of the next unread line. A file shorter than
/// the cursor has been rotated or truncated, which expires the cursor. A
/// trailing line without its newline is still being written and is left for
/// the next poll. Malformed lines are skipped, as are records whose count or
/// times exceed what the bucket store can hold.
#[derive(Debug, Clone)]
pub struct JsonlFeedSource {
    path: PathBuf,
}

impl JsonlFeedSource {
    /// Creates a source tailing `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path being tailed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, SourceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Counts and times above `i64::MAX` cannot be stored.
fn in_store_range(record: &ExternalRecord) -> bool {
    const MAX: u64 = i64::MAX.unsigned_abs();
    record.count <= MAX && record.start_time <= MAX && record.end_time <= MAX
}

/// Length of the prefix of `bytes` made of complete lines.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
}

#[async_trait]
impl CoarseSource for JsonlFeedSource {
    async fn acquire_cursor(&self) -> Result<Cursor, SourceError> {
        let position = self
            .read()
            .await?
            .map_or(0, |bytes| complete_prefix_len(&bytes));
        Ok(Cursor::new(position as u64))
    }

    async fn poll_since(&self, cursor: Cursor) -> Result<PollResult, SourceError> {
        let Some(bytes) = self.read().await? else {
            if cursor.position() > 0 {
                debug!(path = %self.path.display(), "feed disappeared");
                return Ok(PollResult::expired(cursor));
            }
            return Ok(PollResult {
                next_cursor: cursor,
                ..PollResult::default()
            });
        };

        let Some(pending) = usize::try_from(cursor.position())
            .ok()
            .and_then(|start| bytes.get(start..))
        else {
            debug!(
                path = %self.path.display(),
                cursor = cursor.position(),
                len = bytes.len(),
                "feed shorter than cursor"
            );
            return Ok(PollResult::expired(cursor));
        };

        let consumed = complete_prefix_len(pending);
        let mut records = Vec::new();
        for line in pending[..consumed].split(|b| *b == b'\n') {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<ExternalRecord>(line) {
                Ok(record) if in_store_range(&record) => records.push(record),
                Ok(record) => warn!(
                    path = %self.path.display(),
                    origin = %record.origin_id,
                    record = %record.record_id,
                    count = record.count,
                    "skipping out-of-range feed record"
                ),
                Err(e) => warn!(
                    path = %self.path.display(),
                    error = %e,
                    "skipping malformed feed line"
                ),
            }
        }

        Ok(PollResult {
            records,
            next_cursor: Cursor::new(cursor.position() + consumed as u64),
            expired: false,
        })
    }
}
