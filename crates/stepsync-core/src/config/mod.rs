//! Configuration parsing and management.
//!
//! This module parses the TOML file that configures a tracking session: tick
//! cadence, fill policy, store location and retention, the file-backed
//! sources, and the commitment windows.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::surplus::{DEFAULT_BUCKET_CAP, FillPolicy, OverflowPolicy};
use crate::window::{ActiveWindow, WindowSet};

/// Maximum allowed tick interval in seconds.
pub const MAX_TICK_INTERVAL_SECS: u64 = 3600;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StepsyncConfig {
    /// Tick and reconciliation settings.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Bucket store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// File-backed source locations.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Commitment windows.
    #[serde(default)]
    pub windows: Vec<ActiveWindow>,
}

impl StepsyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking.bucket_cap == 0 {
            return Err(ConfigError::Validation(
                "tracking.bucket_cap must be greater than 0".to_string(),
            ));
        }
        if !(1..=MAX_TICK_INTERVAL_SECS).contains(&self.tracking.tick_interval_secs) {
            return Err(ConfigError::Validation(format!(
                "tracking.tick_interval_secs must be within 1..={MAX_TICK_INTERVAL_SECS}, got {}",
                self.tracking.tick_interval_secs
            )));
        }
        if let Some(window) = self.windows.iter().find(|w| w.end <= w.start) {
            return Err(ConfigError::Validation(format!(
                "window [{}, {}) is empty or inverted",
                window.start, window.end
            )));
        }
        Ok(())
    }

    /// Returns the configured windows merged into a [`WindowSet`].
    #[must_use]
    pub fn window_set(&self) -> WindowSet {
        WindowSet::new(self.windows.iter().copied())
    }

    /// Like [`Self::window_set`], without windows that ended at or before
    /// `now`.
    #[must_use]
    pub fn active_windows(&self, now: u64) -> WindowSet {
        let mut windows = self.window_set();
        windows.retain_after(now);
        windows
    }
}

/// Tick and reconciliation settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Seconds between ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Maximum steps an empty bucket may absorb from a coarse report.
    #[serde(default = "default_bucket_cap")]
    pub bucket_cap: u64,

    /// Handling of surplus the empty buckets cannot absorb.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Timeout for one poll of the coarse source, in milliseconds.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl TrackingConfig {
    /// Returns the tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Returns the poll timeout.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Returns the fill policy described by this configuration.
    #[must_use]
    pub const fn fill_policy(&self) -> FillPolicy {
        FillPolicy {
            cap: self.bucket_cap,
            overflow: self.overflow_policy,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            bucket_cap: default_bucket_cap(),
            overflow_policy: OverflowPolicy::default(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

const fn default_tick_interval() -> u64 {
    crate::clock::BUCKET_WIDTH_SECS
}

const fn default_bucket_cap() -> u64 {
    DEFAULT_BUCKET_CAP
}

const fn default_poll_timeout_ms() -> u64 {
    5_000
}

/// Bucket store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path to the `SQLite` database.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Days of buckets to keep. 0 disables pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl StoreConfig {
    /// Returns the bucket start before which buckets may be pruned at `now`,
    /// or `None` when retention is disabled.
    #[must_use]
    pub fn prune_cutoff(&self, now: u64) -> Option<u64> {
        (self.retention_days > 0)
            .then(|| now.saturating_sub(u64::from(self.retention_days) * 86_400))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("stepsync.db")
}

const fn default_retention_days() -> u32 {
    30
}

/// Locations of the file-backed sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SourcesConfig {
    /// File holding the latest cumulative counter value.
    #[serde(default)]
    pub counter_path: Option<PathBuf>,

    /// JSON-lines feed of coarse reports.
    #[serde(default)]
    pub feed_path: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = StepsyncConfig::from_toml("").unwrap();
        assert_eq!(config.tracking.tick_interval_secs, 30);
        assert_eq!(config.tracking.bucket_cap, 90);
        assert_eq!(config.tracking.overflow_policy, OverflowPolicy::Discard);
        assert_eq!(config.tracking.poll_timeout(), Duration::from_secs(5));
        assert_eq!(config.store.path, PathBuf::from("stepsync.db"));
        assert_eq!(config.store.retention_days, 30);
        assert!(config.windows.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [tracking]
            tick_interval_secs = 15
            bucket_cap = 120
            overflow_policy = "dump_into_last_bucket"
            poll_timeout_ms = 2500

            [store]
            path = "/tmp/stepsync/buckets.db"
            retention_days = 7

            [sources]
            counter_path = "/tmp/stepsync/counter"
            feed_path = "/tmp/stepsync/feed.jsonl"

            [[windows]]
            start = 1700000000
            end = 1700003600

            [[windows]]
            start = 1700003600
            end = 1700007200
        "#;

        let config = StepsyncConfig::from_toml(toml).unwrap();
        assert_eq!(config.tracking.tick_interval(), Duration::from_secs(15));
        assert_eq!(
            config.tracking.fill_policy(),
            FillPolicy {
                cap: 120,
                overflow: OverflowPolicy::DumpIntoLastBucket,
            }
        );
        assert_eq!(config.store.retention_days, 7);
        assert_eq!(
            config.sources.feed_path,
            Some(PathBuf::from("/tmp/stepsync/feed.jsonl"))
        );
        assert_eq!(
            config.window_set().windows(),
            &[ActiveWindow::new(1_700_000_000, 1_700_007_200)]
        );
    }

    #[test]
    fn test_reject_zero_cap() {
        let err = StepsyncConfig::from_toml("[tracking]\nbucket_cap = 0\n").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("bucket_cap"), "{msg}"),
            other => panic!("Expected ConfigError::Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_tick_interval_out_of_range() {
        assert!(StepsyncConfig::from_toml("[tracking]\ntick_interval_secs = 0\n").is_err());
        assert!(StepsyncConfig::from_toml("[tracking]\ntick_interval_secs = 7200\n").is_err());
    }

    #[test]
    fn test_reject_inverted_window() {
        let toml = r"
            [[windows]]
            start = 200
            end = 100
        ";
        assert!(matches!(
            StepsyncConfig::from_toml(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_reject_unknown_source_key() {
        let toml = r#"
            [sources]
            counter_file = "/tmp/counter"
        "#;
        assert!(matches!(
            StepsyncConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_overflow_policy_rejected() {
        let toml = r#"
            [tracking]
            overflow_policy = "spread"
        "#;
        assert!(StepsyncConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = StepsyncConfig::default();
        config.windows.push(ActiveWindow::new(0, 3600));
        let rendered = config.to_toml().unwrap();
        assert_eq!(StepsyncConfig::from_toml(&rendered).unwrap(), config);
    }

    #[test]
    fn test_active_windows_drop_finished() {
        let mut config = StepsyncConfig::default();
        config.windows = vec![
            ActiveWindow::new(0, 3600),
            ActiveWindow::new(7200, 9000),
            ActiveWindow::new(10_000, 12_000),
        ];

        assert_eq!(
            config.active_windows(9000).windows(),
            &[ActiveWindow::new(10_000, 12_000)]
        );
        assert_eq!(config.active_windows(3599).windows().len(), 3);
        assert!(config.active_windows(12_000).is_empty());
    }

    #[test]
    fn test_prune_cutoff() {
        let store = StoreConfig {
            retention_days: 1,
            ..StoreConfig::default()
        };
        assert_eq!(store.prune_cutoff(100_000), Some(100_000 - 86_400));

        let disabled = StoreConfig {
            retention_days: 0,
            ..StoreConfig::default()
        };
        assert_eq!(disabled.prune_cutoff(100_000), None);
    }
}
