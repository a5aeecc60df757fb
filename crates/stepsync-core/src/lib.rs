//! # stepsync-core
//!
//! Reconciliation engine for step counts observed by two asynchronous sources:
//! a real-time cumulative counter on the phone, and a coarse, late, possibly
//! multi-writer companion data store.
//!
//! Both sources are folded into one series of fixed 30-second buckets. The
//! phone counter is ground truth for the buckets it observed; coarse reports
//! only contribute the *surplus* they carry beyond what the phone stored for
//! the same span, and only into buckets the phone left empty.
//!
//! ## Modules
//!
//! - [`clock`]: bucket grid arithmetic and the injectable [`Clock`]
//! - [`window`]: commitment windows and [`ActiveWindowProvider`]
//! - [`phone`]: counter deltas with reboot handling
//! - [`origin`]: per-origin delta tracking over cumulative reports
//! - [`surplus`]: subtract-and-fill for a single report
//! - [`reconcile`]: multi-origin combination by bucket-wise maximum
//! - [`store`]: the monotonic [`BucketStore`] contract and its `SQLite`
//!   implementation
//! - [`config`]: TOML configuration
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use stepsync_core::{ExternalRecord, FillBounds, FillPolicy, reconcile};
//!
//! let t0 = 1_700_000_010;
//! // The phone saw 10 steps in each of the first two buckets.
//! let existing = BTreeMap::from([(t0, 10), (t0 + 30, 10)]);
//! let records = [ExternalRecord::new("watch", "r1", t0, t0 + 120, 120)];
//! let bounds = FillBounds {
//!     commitment_start: t0,
//!     commitment_end: t0 + 3600,
//!     now: t0 + 600,
//! };
//!
//! let result = reconcile(&records, &existing, &bounds, &FillPolicy::default());
//! assert_eq!(result.fills, BTreeMap::from([(t0 + 60, 50), (t0 + 90, 50)]));
//! ```

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod origin;
pub mod phone;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod surplus;
pub mod window;


pub use clock::{BUCKET_WIDTH_SECS, Clock, SystemClock, boundaries_for_now, bucket_floor};
pub use config::{ConfigError, StepsyncConfig};
pub use origin::OriginDeltaTracker;
pub use phone::{PhoneDelta, PhoneDeltaComputer, phone_delta};
pub use reconcile::{Reconciliation, reconcile, reconcile_into};
pub use record::{ExternalRecord, ProvenanceEntry};
pub use store::{Bucket, BucketQuery, BucketStore, SqliteBucketStore, StoreError};
pub use surplus::{FillBounds, FillPolicy, OverflowPolicy, ReportSpan, distribute};
pub use window::{ActiveWindow, ActiveWindowProvider, WindowSet};
