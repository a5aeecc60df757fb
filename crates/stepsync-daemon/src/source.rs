//! Source traits for the two inputs of a tracking session.
//!
//! [`CounterSensor`] is the phone's real-time cumulative counter, read once
//! per tick. [`CoarseSource`] is the companion data store: it is polled
//! through an opaque [`Cursor`] and returns cumulative reports that may be
//! late, repeated, or written by several origins.

use async_trait::async_trait;
use stepsync_core::ExternalRecord;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by source adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The underlying file or device could not be read.
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reading could not be interpreted.
    #[error("failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser message.
        reason: String,
    },

    /// The source refused the request.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Cursor
// =============================================================================

/// Opaque position in a coarse source's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cursor(u64);

impl Cursor {
    /// Creates a cursor at `position`.
    #[must_use]
    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the raw position.
    #[must_use]
    pub const fn position(self) -> u64 {
        self.0
    }
}

/// Result of one poll of a [`CoarseSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    /// Reports observed since the cursor.
    pub records: Vec<ExternalRecord>,
    /// Cursor for the next poll.
    pub next_cursor: Cursor,
    /// The cursor is no longer valid; `records` must be ignored and a new
    /// cursor acquired.
    pub expired: bool,
}

impl PollResult {
    /// A poll reporting that `cursor` has expired.
    #[must_use]
    pub const fn expired(cursor: Cursor) -> Self {
        Self {
            records: Vec::new(),
            next_cursor: cursor,
            expired: true,
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// The device's cumulative step counter.
pub trait CounterSensor: Send + Sync {
    /// Returns the latest cumulative reading, or `None` if the sensor has not
    /// produced one yet.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the sensor cannot be read.
    fn latest(&self) -> Result<Option<u64>, SourceError>;
}

/// A companion data store that reports steps coarsely and late.
#[async_trait]
pub trait CoarseSource: Send + Sync {
    /// Acquires a cursor positioned at the current end of the change feed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the source cannot be reached.
    async fn acquire_cursor(&self) -> Result<Cursor, SourceError>;

    /// Returns the reports written since `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the source cannot be read. An expired
    /// cursor is not an error; it is reported through
    /// [`PollResult::expired`].
    async fn poll_since(&self, cursor: Cursor) -> Result<PollResult, SourceError>;
}
