//! stepsync-daemon - tracking session runtime
//!
//! This crate wires the reconciliation engine in `stepsync-core` to its
//! inputs and runs it on a schedule.
//!
//! # Modules
//!
//! - [`source`]: the [`CounterSensor`] and [`CoarseSource`] contracts
//! - [`sources`]: file-backed adapters for both contracts
//! - [`session`]: [`TrackingSession`], one tick of phone and coarse
//!   reconciliation over shared state
//! - [`worker`]: [`SessionWorker`], the periodic driver with retention and
//!   shutdown
//!
//! # Runtime Requirements
//!
//! Store I/O is dispatched with `tokio::task::spawn_blocking`, so the session
//! must run inside a tokio runtime with the blocking pool available. The
//! `stepsync` binary builds a multi-threaded runtime.

#![warn(missing_docs)]

pub mod session;
pub mod source;
pub mod sources;
pub mod worker;

pub use session::{CoarseOutcome, SessionError, SessionState, TickReport, TrackingSession};
pub use source::{CoarseSource, CounterSensor, Cursor, PollResult, SourceError};
pub use sources::{FileCounterSensor, JsonlFeedSource};
pub use worker::{SessionWorker, ShutdownHandle, WorkerConfig};
