//! stepsync - step-count reconciliation daemon
//!
//! Runs a tracking session against the configured sources and inspects or
//! prunes the bucket store.
//!
//! The tokio runtime is only built for `run`; the inspection subcommands are
//! synchronous.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stepsync_core::record::decode_provenance;
use stepsync_core::{
    Bucket, BucketQuery, BucketStore, Clock, ProvenanceEntry, SqliteBucketStore, StepsyncConfig,
    SystemClock,
};
use stepsync_daemon::{
    FileCounterSensor, JsonlFeedSource, SessionWorker, TrackingSession, WorkerConfig,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// stepsync - step-count reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "stepsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "stepsync.toml")]
    config: PathBuf,

    /// Path to the bucket database (overrides `store.path`)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tracking session until SIGINT or SIGTERM
    Run {
        /// Seconds between ticks (overrides `tracking.tick_interval_secs`)
        #[arg(long)]
        tick_interval_secs: Option<u64>,
    },

    /// Print stored buckets as JSON lines
    Buckets {
        /// Only buckets starting at or after this epoch second
        #[arg(long)]
        since: Option<u64>,

        /// Only buckets modified after this epoch millisecond
        #[arg(long)]
        modified_after: Option<u64>,
    },

    /// Apply the retention policy once
    Prune,
}

/// One line of `stepsync buckets` output.
#[derive(Debug, Serialize)]
struct BucketLine {
    start: u64,
    end: u64,
    steps: u64,
    start_utc: Option<String>,
    modified_at: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    provenance: Vec<ProvenanceEntry>,
}

impl BucketLine {
    fn from_bucket(bucket: Bucket) -> Self {
        let provenance = bucket
            .provenance
            .as_deref()
            .map(decode_provenance)
            .transpose()
            .unwrap_or_else(|e| {
                warn!(bucket_start = bucket.start, error = %e, "unreadable provenance");
                None
            })
            .unwrap_or_default();
        Self {
            start: bucket.start,
            end: bucket.end,
            steps: bucket.steps,
            start_utc: i64::try_from(bucket.start)
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|t| t.to_rfc3339()),
            modified_at: i64::try_from(bucket.modified_at_ms)
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|t| t.to_rfc3339()),
            provenance,
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<StepsyncConfig> {
    let mut config = if cli.config.exists() {
        StepsyncConfig::from_file(&cli.config).with_context(|| {
            format!("failed to load configuration from {}", cli.config.display())
        })?
    } else {
        info!(path = %cli.config.display(), "configuration file not found, using defaults");
        StepsyncConfig::default()
    };

    if let Some(db) = &cli.db {
        config.store.path.clone_from(db);
    }
    if let Commands::Run {
        tick_interval_secs: Some(secs),
    } = cli.command
    {
        config.tracking.tick_interval_secs = secs;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_store(path: &Path) -> Result<Arc<SqliteBucketStore>> {
    let store = SqliteBucketStore::open(path)
        .with_context(|| format!("failed to open bucket store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { .. } => {
            let runtime =
                tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
            runtime.block_on(run(config))
        },
        Commands::Buckets {
            since,
            modified_after,
        } => print_buckets(&config, since, modified_after),
        Commands::Prune => prune(&config),
    }
}

async fn run(config: StepsyncConfig) -> Result<()> {
    let store = open_store(&config.store.path)?;

    let windows = config.active_windows(SystemClock.now_secs());
    if windows.is_empty() {
        warn!("no current or upcoming commitment windows, coarse reconciliation is disabled");
    }

    let mut session = TrackingSession::new(store.clone(), Arc::new(windows))
        .with_fill_policy(config.tracking.fill_policy())
        .with_poll_timeout(config.tracking.poll_timeout());
    if let Some(path) = &config.sources.counter_path {
        session = session.with_counter(Arc::new(FileCounterSensor::new(path)));
    }
    if let Some(path) = &config.sources.feed_path {
        session = session.with_coarse_source(Arc::new(JsonlFeedSource::new(path)));
    }

    let worker = Arc::new(SessionWorker::new(
        Arc::new(session),
        store,
        Arc::new(SystemClock),
        WorkerConfig::from_config(&config),
    ));
    let shutdown = worker.shutdown_handle();

    info!(
        started_at = %Utc::now().to_rfc3339(),
        store = %config.store.path.display(),
        counter = config.sources.counter_path.is_some(),
        feed = config.sources.feed_path.is_some(),
        windows = config.windows.len(),
        "stepsync starting"
    );

    let worker_task = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    shutdown.request();
    let ticks = worker_task.await.context("session worker task failed")?;
    info!(ticks, "stepsync stopped");
    Ok(())
}

fn print_buckets(
    config: &StepsyncConfig,
    since: Option<u64>,
    modified_after: Option<u64>,
) -> Result<()> {
    let store = open_store(&config.store.path)?;
    let query = BucketQuery {
        since_start: since,
        modified_after_ms: modified_after,
    };
    let buckets = store.query(&query).context("failed to query buckets")?;

    for bucket in buckets {
        let line = serde_json::to_string(&BucketLine::from_bucket(bucket))
            .context("failed to serialize bucket")?;
        println!("{line}");
    }
    Ok(())
}

fn prune(config: &StepsyncConfig) -> Result<()> {
    let Some(cutoff) = config.store.prune_cutoff(SystemClock.now_secs()) else {
        info!("retention disabled, nothing to prune");
        return Ok(());
    };
    let store = open_store(&config.store.path)?;
    let deleted = store
        .prune_before(cutoff)
        .context("failed to prune buckets")?;
    info!(cutoff, deleted, "pruned expired buckets");
    Ok(())
}
