//! Bucket grid arithmetic and time sources.
//!
//! All instants are whole seconds since the UNIX epoch. A bucket is the
//! half-open interval `[start, start + BUCKET_WIDTH_SECS)` where `start` is a
//! multiple of [`BUCKET_WIDTH_SECS`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of a single bucket in seconds.
pub const BUCKET_WIDTH_SECS: u64 = 30;

/// Floors `instant` to the start of the bucket containing it.
#[must_use]
pub const fn bucket_floor(instant: u64) -> u64 {
    instant - instant % BUCKET_WIDTH_SECS
}

/// Returns `(start, end)` of the bucket that elapsed most recently at `now`.
///
/// `end` is `now` floored to the grid, so a tick landing mid-bucket reports
/// the last complete bucket rather than the one still in progress.
#[must_use]
pub const fn boundaries_for_now(now: u64) -> (u64, u64) {
    let end = bucket_floor(now);
    (end.saturating_sub(BUCKET_WIDTH_SECS), end)
}

/// Returns the start of every bucket intersecting `[start, end)`, ascending.
///
/// An empty or inverted interval touches no buckets.
#[must_use]
pub fn buckets_touching(start: u64, end: u64) -> Vec<u64> {
    if end <= start {
        return Vec::new();
    }
    (bucket_floor(start)..end)
        .step_by(usize::try_from(BUCKET_WIDTH_SECS).unwrap_or(30))
        .collect()
}

/// Abstraction over wall-clock time so ticks and store timestamps can be
/// driven deterministically in tests.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current wall-clock time in milliseconds since UNIX epoch.
    fn now_ms(&self) -> u64;

    /// Returns the current wall-clock time in whole seconds since UNIX epoch.
    fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Production clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
