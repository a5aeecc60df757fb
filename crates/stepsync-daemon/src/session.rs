//! Tracking session: one tick of phone and coarse reconciliation.
//!
//! A [`TrackingSession`] owns the per-session state (phone baseline, origin
//! tracker, feed cursor) behind an async mutex held for a whole tick, so ticks
//! never interleave. Each tick:
//!
//! 1. Reads the counter and credits its delta to the bucket that just closed.
//! 2. If a commitment window is active, polls the coarse source and fills
//!    the phone's empty buckets with the surplus of any origin that reported
//!    new steps.
//!
//! Store I/O runs on the blocking pool. State is committed only after every
//! write of its path succeeded, so a failed tick can be retried as-is.
//!
//! # Degradation
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | No active window | [`CoarseOutcome::NoWindow`], phone path still runs |
//! | Poll error or timeout | [`CoarseOutcome::PollFailed`], no state change |
//! | Cursor expired | [`CoarseOutcome::Expired`], cursor re-acquired |
//! | Counter or store failure | `Err(SessionError)` |

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stepsync_core::{
    ActiveWindowProvider, BucketStore, ExternalRecord, FillBounds, FillPolicy,
    OriginDeltaTracker, PhoneDelta, PhoneDeltaComputer, StoreError, boundaries_for_now,
    phone_delta, reconcile_into,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::source::{CoarseSource, CounterSensor, Cursor, SourceError};

/// Default bound on a single coarse poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Errors
// =============================================================================

/// Errors that abort a tick.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The bucket store rejected a read or write.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The counter sensor could not be read.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// A blocking task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// =============================================================================
// Reports
// =============================================================================

/// What the coarse path did during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseOutcome {
    /// No coarse source is configured.
    NoSource,
    /// No commitment window is active.
    NoWindow,
    /// The poll failed or timed out.
    PollFailed,
    /// The cursor expired; records were dropped and a new cursor acquired.
    Expired,
    /// First poll of the session; records were learned, nothing credited.
    Baselined {
        /// Records observed.
        records: usize,
    },
    /// No origin reported new steps.
    NoNewSteps,
    /// Surplus was distributed.
    Reconciled {
        /// Origins with new steps.
        origins: usize,
        /// Buckets that received a fill.
        buckets: usize,
        /// Total steps filled.
        steps: u64,
    },
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Instant the tick ran at, epoch seconds.
    pub now: u64,
    /// Steps credited from the counter.
    pub phone_steps: u64,
    /// Coarse path outcome.
    pub coarse: CoarseOutcome,
}

// =============================================================================
// Session
// =============================================================================

/// Mutable state carried across ticks.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Counter baseline.
    pub phone: PhoneDeltaComputer,
    /// Per-origin cumulative counts and reconciliation horizon.
    pub tracker: OriginDeltaTracker,
    /// Position in the coarse feed.
    pub cursor: Option<Cursor>,
    /// Last bucket credited from the counter, as `(bucket_start, steps)`.
    pub phone_bucket: Option<(u64, u64)>,
}

/// Drives reconciliation for one tracking session.
pub struct TrackingSession {
    store: Arc<dyn BucketStore>,
    windows: Arc<dyn ActiveWindowProvider>,
    counter: Option<Arc<dyn CounterSensor>>,
    coarse: Option<Arc<dyn CoarseSource>>,
    policy: FillPolicy,
    poll_timeout: Duration,
    state: Mutex<SessionState>,
}

impl fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingSession")
            .field("has_counter", &self.counter.is_some())
            .field("has_coarse", &self.coarse.is_some())
            .field("policy", &self.policy)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

impl TrackingSession {
    /// Creates a session writing to `store` and reconciling inside `windows`.
    #[must_use]
    pub fn new(store: Arc<dyn BucketStore>, windows: Arc<dyn ActiveWindowProvider>) -> Self {
        Self {
            store,
            windows,
            counter: None,
            coarse: None,
            policy: FillPolicy::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Attaches the phone counter.
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<dyn CounterSensor>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Attaches the coarse source.
    #[must_use]
    pub fn with_coarse_source(mut self, source: Arc<dyn CoarseSource>) -> Self {
        self.coarse = Some(source);
        self
    }

    /// Sets the fill policy.
    #[must_use]
    pub const fn with_fill_policy(mut self, policy: FillPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the bound on each coarse source call.
    #[must_use]
    pub const fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Returns a copy of the current state.
    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Forgets all session state, as at session start.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.phone.reset();
        state.tracker.reset();
        state.cursor = None;
        state.phone_bucket = None;
        info!("tracking session reset");
    }

    /// Runs one tick at `now` (epoch seconds).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the counter cannot be read or the store
    /// fails. State touched by the failing path is left as it was.
    pub async fn tick(&self, now: u64) -> Result<TickReport, SessionError> {
        let mut state = self.state.lock().await;

        let phone_steps = self.tick_phone(&mut state, now).await?;
        let coarse = self.tick_coarse(&mut state, now).await?;

        debug!(now, phone_steps, ?coarse, "tick complete");
        Ok(TickReport {
            now,
            phone_steps,
            coarse,
        })
    }

    async fn tick_phone(&self, state: &mut SessionState, now: u64) -> Result<u64, SessionError> {
        let Some(counter) = &self.counter else {
            return Ok(0);
        };
        let counter = Arc::clone(counter);
        let Some(current) = tokio::task::spawn_blocking(move || counter.latest()).await?? else {
            return Ok(0);
        };

        let PhoneDelta { delta, .. } = phone_delta(current, state.phone.baseline());
        if delta > 0 {
            let (start, end) = boundaries_for_now(now);
            // Several ticks can close on the same bucket. Accumulate what the
            // counter credited there, never what the store holds.
            let credited = match state.phone_bucket {
                Some((bucket, steps)) if bucket == start => steps,
                _ => 0,
            }
            .saturating_add(delta);
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || store.upsert(start, end, credited, None)).await??;
            state.phone_bucket = Some((start, credited));
            debug!(bucket_start = start, steps = delta, credited, "credited phone steps");
        }

        state.phone.observe(current);
        Ok(delta)
    }

    async fn tick_coarse(
        &self,
        state: &mut SessionState,
        now: u64,
    ) -> Result<CoarseOutcome, SessionError> {
        let Some(source) = &self.coarse else {
            return Ok(CoarseOutcome::NoSource);
        };
        let Some(window) = self.windows.active_window_at(now) else {
            return Ok(CoarseOutcome::NoWindow);
        };

        let cursor = match state.cursor {
            Some(cursor) => cursor,
            None => match self.acquire_cursor(source.as_ref()).await {
                Some(cursor) => {
                    state.cursor = Some(cursor);
                    cursor
                },
                None => return Ok(CoarseOutcome::PollFailed),
            },
        };

        let poll = match timeout(self.poll_timeout, source.poll_since(cursor)).await {
            Ok(Ok(poll)) => poll,
            Ok(Err(e)) => {
                warn!(error = %e, "coarse poll failed");
                return Ok(CoarseOutcome::PollFailed);
            },
            Err(_) => {
                warn!(timeout = ?self.poll_timeout, "coarse poll timed out");
                return Ok(CoarseOutcome::PollFailed);
            },
        };

        if poll.expired {
            warn!(cursor = cursor.position(), "coarse cursor expired, re-acquiring");
            state.cursor = self.acquire_cursor(source.as_ref()).await;
            return Ok(CoarseOutcome::Expired);
        }

        let mut tracker = state.tracker.clone();
        let deltas = tracker.compute_record_deltas(&poll.records);

        if !state.tracker.is_primed() {
            tracker.mark_processed(now);
            state.tracker = tracker;
            state.cursor = Some(poll.next_cursor);
            info!(records = poll.records.len(), "coarse source baselined");
            return Ok(CoarseOutcome::Baselined {
                records: poll.records.len(),
            });
        }

        // Only records carrying new steps of their own take part; a late
        // aggregate or a revision of history stays out even when its origin
        // reported something new alongside it.
        let records: Vec<ExternalRecord> = poll
            .records
            .into_iter()
            .zip(deltas)
            .filter_map(|(record, delta)| (delta > 0).then_some(record))
            .collect();
        if records.is_empty() {
            // The horizon stays put; these buckets may still be filled later.
            state.tracker = tracker;
            state.cursor = Some(poll.next_cursor);
            return Ok(CoarseOutcome::NoNewSteps);
        }

        let origins = records
            .iter()
            .map(|r| r.origin_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let bounds = FillBounds {
            commitment_start: window.start,
            commitment_end: window.end,
            now,
        };
        let policy = self.policy;
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || {
            reconcile_into(store.as_ref(), &records, &bounds, &policy)
        })
        .await??;

        tracker.mark_processed(now);
        state.tracker = tracker;
        state.cursor = Some(poll.next_cursor);

        info!(
            origins,
            buckets = result.fills.len(),
            steps = result.total(),
            "coarse surplus reconciled"
        );
        Ok(CoarseOutcome::Reconciled {
            origins,
            buckets: result.fills.len(),
            steps: result.total(),
        })
    }

    async fn acquire_cursor(&self, source: &dyn CoarseSource) -> Option<Cursor> {
        match timeout(self.poll_timeout, source.acquire_cursor()).await {
            Ok(Ok(cursor)) => Some(cursor),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to acquire coarse cursor");
                None
            },
            Err(_) => {
                warn!(timeout = ?self.poll_timeout, "timed out acquiring coarse cursor");
                None
            },
        }
    }
}
