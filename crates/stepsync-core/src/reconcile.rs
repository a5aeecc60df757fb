//! Multi-origin reconciliation of coarse reports.
//!
//! Every record is distributed against the same stored baseline. Results are
//! combined with a bucket-wise maximum, both between records of one origin and
//! between origins: two writers reporting the same walk are measuring the same
//! physical steps, so their fills must never add up.

use std::collections::BTreeMap;

use crate::clock::{BUCKET_WIDTH_SECS, bucket_floor};
use crate::record::{ExternalRecord, ProvenanceEntry, encode_provenance};
use crate::store::{BucketStore, StoreError};
use crate::surplus::{FillBounds, FillPolicy, ReportSpan, distribute};

/// Outcome of reconciling one batch of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Amount to add on top of each bucket's stored count.
    pub fills: BTreeMap<u64, u64>,
    /// Records that produced a fill for each bucket, ordered by start time.
    pub provenance: BTreeMap<u64, Vec<ProvenanceEntry>>,
}

impl Reconciliation {
    /// Returns `true` if no bucket receives anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fills.is_empty()
    }

    /// Sum of all fills.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.fills.values().fold(0, |acc, v| acc.saturating_add(*v))
    }

    /// Writes the fills on top of `existing` through the store's monotonic
    /// upsert, attaching provenance. Returns the number of buckets whose
    /// stored count increased.
    ///
    /// Applying the same reconciliation twice leaves the store unchanged the
    /// second time.
    ///
    /// # Errors
    ///
    /// Returns the first store or serialization error; buckets written before
    /// it keep their new values.
    pub fn apply(
        &self,
        store: &dyn BucketStore,
        existing: &BTreeMap<u64, u64>,
    ) -> Result<usize, StoreError> {
        let mut increased = 0;
        for (bucket, fill) in &self.fills {
            let base = existing.get(bucket).copied().unwrap_or(0);
            let provenance = self
                .provenance
                .get(bucket)
                .map(|entries| encode_provenance(entries))
                .transpose()?;
            if store.upsert(
                *bucket,
                bucket + BUCKET_WIDTH_SECS,
                base.saturating_add(*fill),
                provenance.as_deref(),
            )? {
                increased += 1;
            }
        }
        Ok(increased)
    }
}

/// Reads the stored counts covering `records`, reconciles, and applies the
/// result to `store`.
///
/// # Errors
///
/// Returns an error if reading or writing the store fails.
pub fn reconcile_into(
    store: &dyn BucketStore,
    records: &[ExternalRecord],
    bounds: &FillBounds,
    policy: &FillPolicy,
) -> Result<Reconciliation, StoreError> {
    let Some(from) = records.iter().map(|r| bucket_floor(r.start_time)).min() else {
        return Ok(Reconciliation::default());
    };
    let to = records.iter().map(|r| r.end_time).max().unwrap_or(from);

    let existing = store.counts(from, to)?;
    let result = reconcile(records, &existing, bounds, policy);
    let increased = result.apply(store, &existing)?;
    tracing::debug!(
        records = records.len(),
        buckets = result.fills.len(),
        increased,
        total = result.total(),
        "reconciled coarse records"
    );
    Ok(result)
}

/// Distributes `records` over the buckets in `existing`.
///
/// `existing` maps bucket starts to stored counts and must cover every bucket
/// the records touch; missing buckets are read as zero.
#[must_use]
pub fn reconcile(
    records: &[ExternalRecord],
    existing: &BTreeMap<u64, u64>,
    bounds: &FillBounds,
    policy: &FillPolicy,
) -> Reconciliation {
    let mut by_origin: BTreeMap<&str, Vec<&ExternalRecord>> = BTreeMap::new();
    for record in records {
        by_origin
            .entry(record.origin_id.as_str())
            .or_default()
            .push(record);
    }

    let mut result = Reconciliation::default();
    for (origin, origin_records) in by_origin {
        let mut origin_fills: BTreeMap<u64, u64> = BTreeMap::new();
        for record in origin_records {
            let span = ReportSpan {
                start: record.start_time,
                end: record.end_time,
                count: record.count,
            };
            let fills = distribute(span, existing, bounds, policy);
            for (bucket, amount) in &fills {
                max_into(&mut origin_fills, *bucket, *amount);
                result
                    .provenance
                    .entry(*bucket)
                    .or_default()
                    .push(ProvenanceEntry::from(record));
            }
        }
        tracing::trace!(
            origin,
            buckets = origin_fills.len(),
            total = origin_fills.values().sum::<u64>(),
            "origin distribution"
        );
        for (bucket, amount) in origin_fills {
            max_into(&mut result.fills, bucket, amount);
        }
    }

    for entries in result.provenance.values_mut() {
        entries.sort_by(|a, b| {
            (a.start_time, a.end_time, &a.origin_id).cmp(&(b.start_time, b.end_time, &b.origin_id))
        });
    }
    result
}

fn max_into(target: &mut BTreeMap<u64, u64>, bucket: u64, amount: u64) {
    let slot = target.entry(bucket).or_insert(0);
    *slot = (*slot).max(amount);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteBucketStore;
    use crate::surplus::OverflowPolicy;

    const T0: u64 = 1_700_000_010;

    fn bounds() -> FillBounds {
        FillBounds {
            commitment_start: T0,
            commitment_end: T0 + 3600,
            now: T0 + 3600,
        }
    }

    #[test]
    fn overlapping_origins_take_maximum() {
        let records = [
            ExternalRecord::new("watch", "w1", T0, T0 + 120, 120),
            ExternalRecord::new("mirror", "m1", T0, T0 + 120, 120),
        ];
        let result = reconcile(&records, &BTreeMap::new(), &bounds(), &FillPolicy::default());

        assert_eq!(result.total(), 120);
        assert_eq!(result.fills.len(), 4);
        assert!(result.fills.values().all(|v| *v == 30));
        assert_eq!(result.provenance[&T0].len(), 2);
    }

    #[test]
    fn larger_origin_wins_per_bucket() {
        let records = [
            ExternalRecord::new("watch", "w1", T0, T0 + 60, 100),
            ExternalRecord::new("ring", "r1", T0, T0 + 60, 40),
        ];
        let result = reconcile(&records, &BTreeMap::new(), &bounds(), &FillPolicy::default());
        assert_eq!(result.fills, BTreeMap::from([(T0, 50), (T0 + 30, 50)]));
    }

    #[test]
    fn overlapping_records_of_one_origin_do_not_stack() {
        let records = [
            ExternalRecord::new("watch", "w1", T0, T0 + 60, 60),
            ExternalRecord::new("watch", "w2", T0, T0 + 60, 60),
        ];
        let result = reconcile(&records, &BTreeMap::new(), &bounds(), &FillPolicy::default());
        assert_eq!(result.total(), 60);
    }

    #[test]
    fn disjoint_records_of_one_origin_both_land() {
        let records = [
            ExternalRecord::new("watch", "w1", T0, T0 + 60, 60),
            ExternalRecord::new("watch", "w2", T0 + 60, T0 + 120, 20),
        ];
        let result = reconcile(&records, &BTreeMap::new(), &bounds(), &FillPolicy::default());
        assert_eq!(
            result.fills,
            BTreeMap::from([(T0, 30), (T0 + 30, 30), (T0 + 60, 10), (T0 + 90, 10)])
        );
        assert_eq!(result.provenance[&(T0 + 60)][0].count, 20);
    }

    #[test]
    fn phone_baseline_is_shared_by_origins() {
        let existing = BTreeMap::from([(T0, 10), (T0 + 30, 10)]);
        let records = [
            ExternalRecord::new("watch", "w1", T0, T0 + 120, 120),
            ExternalRecord::new("ring", "r1", T0, T0 + 120, 60),
        ];
        let result = reconcile(&records, &existing, &bounds(), &FillPolicy::default());
        assert_eq!(result.fills, BTreeMap::from([(T0 + 60, 50), (T0 + 90, 50)]));
    }

    #[test]
    fn overflow_policy_is_forwarded() {
        let existing = BTreeMap::from([(T0, 10), (T0 + 30, 10)]);
        let records = [ExternalRecord::new("watch", "w1", T0, T0 + 60, 50)];
        let policy = FillPolicy {
            cap: 90,
            overflow: OverflowPolicy::DumpIntoLastBucket,
        };
        let result = reconcile(&records, &existing, &bounds(), &policy);
        assert_eq!(result.fills, BTreeMap::from([(T0 + 30, 30)]));
    }

    #[test]
    fn apply_saturates_on_huge_base() {
        let store = SqliteBucketStore::in_memory().unwrap();
        let existing = BTreeMap::from([(T0, u64::MAX - 10)]);
        let result = Reconciliation {
            fills: BTreeMap::from([(T0, 50)]),
            ..Reconciliation::default()
        };

        assert_eq!(result.apply(&store, &existing).unwrap(), 1);
        assert_eq!(store.get(T0).unwrap().unwrap().steps, i64::MAX.unsigned_abs());
    }

    #[test]
    fn no_records_is_empty() {
        let result = reconcile(&[], &BTreeMap::new(), &bounds(), &FillPolicy::default());
        assert!(result.is_empty());
        assert!(result.provenance.is_empty());
    }
}
