//! Per-origin delta tracking over cumulative coarse reports.
//!
//! Coarse reports are cumulative per record identity and are re-observed every
//! time the companion store is polled. The tracker remembers the last count
//! seen for each `(origin, record)` pair and the horizon up to which activity
//! has already been reconciled, and from those decides how many steps of a
//! poll are genuinely new.
//!
//! The horizon only moves when the caller invokes
//! [`OriginDeltaTracker::mark_processed`]. Advancing it on a poll that yielded
//! nothing would push it past buckets that can still be filled, and records
//! for that span would then be treated as history.

use std::collections::{BTreeMap, HashMap};

use crate::record::ExternalRecord;

/// Stateful delta computation for one tracking session.
#[derive(Debug, Clone, Default)]
pub struct OriginDeltaTracker {
    /// `origin_id -> (record_id -> last observed count)`.
    known: HashMap<String, HashMap<String, u64>>,
    last_process_time: Option<u64>,
}

impl OriginDeltaTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the reconciliation horizon, if any poll has been consumed.
    #[must_use]
    pub const fn last_process_time(&self) -> Option<u64> {
        self.last_process_time
    }

    /// Returns `true` once the first poll has been consumed.
    #[must_use]
    pub const fn is_primed(&self) -> bool {
        self.last_process_time.is_some()
    }

    /// Returns the last count observed for a record identity.
    #[must_use]
    pub fn known_count(&self, origin_id: &str, record_id: &str) -> Option<u64> {
        self.known
            .get(origin_id)
            .and_then(|records| records.get(record_id))
            .copied()
    }

    /// Computes the new steps carried by each record, in input order.
    ///
    /// A record with delta zero holds nothing that may be credited, even when
    /// other records of its origin do. The stored count for each record
    /// identity is updated whichever branch applies.
    pub fn compute_record_deltas(&mut self, records: &[ExternalRecord]) -> Vec<u64> {
        records
            .iter()
            .map(|record| {
                let delta = match self.last_process_time {
                    // First poll of the session: everything is pre-existing.
                    None => 0,
                    Some(horizon) => {
                        match self.known_count(&record.origin_id, &record.record_id) {
                            Some(_) if record.end_time <= horizon => 0,
                            Some(previous) => record.count.saturating_sub(previous),
                            None if record.start_time < horizon => 0,
                            None => record.count,
                        }
                    },
                };

                self.known
                    .entry(record.origin_id.clone())
                    .or_default()
                    .insert(record.record_id.clone(), record.count);
                delta
            })
            .collect()
    }

    /// Computes the new steps per origin contained in `records`.
    ///
    /// Every origin present in `records` gets an entry, even when its delta
    /// is zero.
    pub fn compute_deltas(&mut self, records: &[ExternalRecord]) -> BTreeMap<String, u64> {
        let per_record = self.compute_record_deltas(records);
        let mut deltas: BTreeMap<String, u64> = BTreeMap::new();
        for (record, delta) in records.iter().zip(per_record) {
            let slot = deltas.entry(record.origin_id.clone()).or_insert(0);
            *slot = slot.saturating_add(delta);
        }
        deltas
    }

    /// Advances the horizon to `now`. The horizon never moves backwards.
    pub fn mark_processed(&mut self, now: u64) {
        self.last_process_time = Some(self.last_process_time.map_or(now, |t| t.max(now)));
    }

    /// Clears all state, as at session start.
    pub fn reset(&mut self) {
        self.known.clear();
        self.last_process_time = None;
    }
}
