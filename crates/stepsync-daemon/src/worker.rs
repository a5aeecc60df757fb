//! Periodic driver for a [`TrackingSession`].
//!
//! The worker ticks the session on a fixed interval and applies the store's
//! retention policy every so often. Errors from a tick are logged and the
//! next tick proceeds normally. Shutdown stops scheduling new ticks; a tick
//! already running completes first.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use stepsync_core::config::StoreConfig;
use stepsync_core::{BucketStore, Clock, StepsyncConfig, StoreError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::session::{SessionError, TickReport, TrackingSession};

/// Number of ticks between retention passes at the default tick interval.
const DEFAULT_PRUNE_EVERY: u64 = 120;

/// Configuration for [`SessionWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between ticks.
    pub tick_interval: Duration,
    /// Ticks between retention passes.
    pub prune_every: u64,
    /// Retention settings.
    pub store: StoreConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(stepsync_core::BUCKET_WIDTH_SECS),
            prune_every: DEFAULT_PRUNE_EVERY,
            store: StoreConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Derives a worker configuration from the file configuration. Retention
    /// runs roughly hourly.
    #[must_use]
    pub fn from_config(config: &StepsyncConfig) -> Self {
        Self {
            tick_interval: config.tracking.tick_interval(),
            prune_every: (3600 / config.tracking.tick_interval_secs.max(1)).max(1),
            store: config.store.clone(),
        }
    }

    /// Sets the tick interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the number of ticks between retention passes.
    #[must_use]
    pub const fn with_prune_every(mut self, ticks: u64) -> Self {
        self.prune_every = ticks;
        self
    }

    /// Sets the retention settings.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// Requests a [`SessionWorker`] to stop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ShutdownHandle {
    /// Asks the worker to stop after the current tick.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Returns `true` once shutdown was requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }
}

/// Ticks a session until shut down.
pub struct SessionWorker {
    session: Arc<TrackingSession>,
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    shutdown: ShutdownHandle,
}

impl fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionWorker")
            .field("session", &self.session)
            .field("config", &self.config)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl SessionWorker {
    /// Creates a worker for `session`, pruning `store`.
    #[must_use]
    pub fn new(
        session: Arc<TrackingSession>,
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            session,
            store,
            clock,
            config,
            shutdown: ShutdownHandle::default(),
        }
    }

    /// Returns a handle for requesting shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs one tick at the clock's current time.
    ///
    /// # Errors
    ///
    /// Propagates the session's error.
    pub async fn run_once(&self) -> Result<TickReport, SessionError> {
        self.session.tick(self.clock.now_secs()).await
    }

    /// Applies the retention policy at `now`. Returns the number of buckets
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn prune(&self, now: u64) -> Result<usize, SessionError> {
        let Some(cutoff) = self.config.store.prune_cutoff(now) else {
            return Ok(0);
        };
        let store = Arc::clone(&self.store);
        let deleted =
            tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
                store.prune_before(cutoff)
            })
            .await??;
        debug!(cutoff, deleted, "retention pass complete");
        Ok(deleted)
    }

    /// Runs the tick loop until shutdown is requested. Returns the number of
    /// ticks executed.
    #[allow(clippy::cast_possible_truncation)] // tick interval is bounded by config validation
    pub async fn run(&self) -> u64 {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            prune_every = self.config.prune_every,
            "session worker starting"
        );

        let mut ticks: u64 = 0;
        while !self.shutdown.is_requested() {
            if self.config.prune_every > 0 && ticks % self.config.prune_every == 0 {
                if let Err(e) = self.prune(self.clock.now_secs()).await {
                    warn!(error = %e, "retention pass failed");
                }
            }

            match self.run_once().await {
                Ok(report) => debug!(?report, "tick"),
                Err(e) => warn!(error = %e, "tick failed"),
            }
            ticks = ticks.wrapping_add(1);

            tokio::select! {
                () = tokio::time::sleep(self.config.tick_interval) => {},
                () = self.shutdown.wake.notified() => {},
            }
        }

        info!(ticks, "session worker shutting down");
        ticks
    }
}

#[cfg(test)]
mod tests {
    use stepsync_core::{BucketQuery, SqliteBucketStore, SystemClock, WindowSet};

    use super::*;

    fn worker(store: Arc<SqliteBucketStore>, config: WorkerConfig) -> SessionWorker {
        let session = Arc::new(TrackingSession::new(
            store.clone(),
            Arc::new(WindowSet::default()),
        ));
        SessionWorker::new(session, store, Arc::new(SystemClock), config)
    }

    #[test]
    fn config_from_file_config() {
        let config = StepsyncConfig::from_toml(
            "[tracking]\ntick_interval_secs = 15\n[store]\nretention_days = 3\n",
        )
        .unwrap();
        let worker_config = WorkerConfig::from_config(&config);
        assert_eq!(worker_config.tick_interval, Duration::from_secs(15));
        assert_eq!(worker_config.prune_every, 240);
        assert_eq!(worker_config.store.retention_days, 3);
    }

    #[tokio::test]
    async fn shutdown_before_run_exits_immediately() {
        let store = Arc::new(SqliteBucketStore::in_memory().unwrap());
        let worker = worker(store, WorkerConfig::default());
        worker.shutdown_handle().request();
        assert_eq!(worker.run().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval_until_shutdown() {
        let store = Arc::new(SqliteBucketStore::in_memory().unwrap());
        let config = WorkerConfig::default().with_store(StoreConfig {
            retention_days: 0,
            ..StoreConfig::default()
        });
        let worker = Arc::new(worker(store, config));
        let shutdown = worker.shutdown_handle();

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run().await }
        });

        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown.request();
        assert_eq!(task.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn prune_applies_retention() {
        let store = Arc::new(SqliteBucketStore::in_memory().unwrap());
        let now = 10 * 86_400;
        store.upsert(30, 60, 5, None).unwrap();
        store.upsert(now - 60, now - 30, 7, None).unwrap();

        let config = WorkerConfig::default().with_store(StoreConfig {
            retention_days: 1,
            ..StoreConfig::default()
        });
        let worker = worker(store.clone(), config);

        assert_eq!(worker.prune(now).await.unwrap(), 1);
        let remaining = store.query(&BucketQuery::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].steps, 7);
    }

    #[tokio::test]
    async fn prune_disabled_by_zero_retention() {
        let store = Arc::new(SqliteBucketStore::in_memory().unwrap());
        store.upsert(30, 60, 5, None).unwrap();
        let config = WorkerConfig::default().with_store(StoreConfig {
            retention_days: 0,
            ..StoreConfig::default()
        });
        let worker = worker(store, config);
        assert_eq!(worker.prune(10 * 86_400).await.unwrap(), 0);
    }
}
