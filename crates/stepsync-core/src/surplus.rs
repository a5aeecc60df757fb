//! Subtract-and-fill distribution of a coarse report's surplus.
//!
//! A coarse report covers several fine buckets. Whatever the report claims
//! beyond what the phone already stored for the same buckets is surplus, and
//! the surplus is spread evenly over the buckets the phone left empty. Buckets
//! outside the active commitment window, and buckets that have not yet
//! elapsed, never receive anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::{bucket_floor, buckets_touching};

/// Default per-bucket plausibility cap (a 180 steps/min cadence).
pub const DEFAULT_BUCKET_CAP: u64 = 90;

/// What to do with surplus that the empty buckets cannot absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop surplus beyond `empty buckets * cap`, and all surplus when every
    /// bucket already holds phone steps.
    #[default]
    Discard,
    /// Add the unabsorbed surplus, uncapped, to the last eligible bucket.
    DumpIntoLastBucket,
}

/// The interval and total of one coarse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSpan {
    /// Start of the report, epoch seconds.
    pub start: u64,
    /// End of the report, epoch seconds.
    pub end: u64,
    /// Reported total for the interval.
    pub count: u64,
}

/// Limits on which buckets may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillBounds {
    /// Start of the active commitment window.
    pub commitment_start: u64,
    /// End of the active commitment window.
    pub commitment_end: u64,
    /// Current instant; buckets starting at or after `floor(now)` are open.
    pub now: u64,
}

impl FillBounds {
    /// Returns `true` if the bucket starting at `bucket_start` may be filled.
    #[must_use]
    pub fn admits(&self, bucket_start: u64) -> bool {
        let limit = self.commitment_end.min(bucket_floor(self.now));
        bucket_start >= self.commitment_start && bucket_start < limit
    }
}

/// Capacity rules for a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillPolicy {
    /// Maximum steps a single empty bucket may absorb.
    pub cap: u64,
    /// Handling of surplus above capacity.
    pub overflow: OverflowPolicy,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self {
            cap: DEFAULT_BUCKET_CAP,
            overflow: OverflowPolicy::Discard,
        }
    }
}

/// Computes per-bucket fill amounts for one report.
///
/// `existing` maps bucket starts to the counts already stored; absent buckets
/// hold zero. The returned amounts are to be added on top of what each bucket
/// holds. The whole `report.count` is weighed against the phone total even
/// when only part of the report's span lies inside `bounds`.
#[must_use]
pub fn distribute(
    report: ReportSpan,
    existing: &BTreeMap<u64, u64>,
    bounds: &FillBounds,
    policy: &FillPolicy,
) -> BTreeMap<u64, u64> {
    let mut fills = BTreeMap::new();
    if report.count == 0 || report.end <= report.start {
        return fills;
    }

    let eligible: Vec<u64> = buckets_touching(report.start, report.end)
        .into_iter()
        .filter(|start| bounds.admits(*start))
        .collect();
    let Some(&last) = eligible.last() else {
        return fills;
    };

    let stored = |start: &u64| existing.get(start).copied().unwrap_or(0);
    let phone_total = eligible.iter().map(stored).fold(0_u64, u64::saturating_add);
    let surplus = report.count.saturating_sub(phone_total);
    if surplus == 0 {
        return fills;
    }

    let empty: Vec<u64> = eligible.iter().copied().filter(|s| stored(s) == 0).collect();
    let empty_count = empty.len() as u64;
    let absorbed = surplus.min(empty_count.saturating_mul(policy.cap));
    let overflow = surplus - absorbed;

    if empty_count > 0 {
        let share = absorbed / empty_count;
        let remainder = absorbed % empty_count;
        for (i, start) in (0_u64..).zip(&empty) {
            let amount = share + u64::from(i < remainder);
            if amount > 0 {
                fills.insert(*start, amount);
            }
        }
    }

    if overflow > 0 {
        match policy.overflow {
            OverflowPolicy::Discard => {
                tracing::debug!(
                    report_start = report.start,
                    report_end = report.end,
                    discarded = overflow,
                    "surplus exceeds absorbable capacity"
                );
            },
            OverflowPolicy::DumpIntoLastBucket => {
                let slot = fills.entry(last).or_insert(0);
                *slot = slot.saturating_add(overflow);
            },
        }
    }

    fills
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_010;

    fn existing(counts: &[u64]) -> BTreeMap<u64, u64> {
        (0_u64..)
            .zip(counts)
            .filter(|(_, c)| **c > 0)
            .map(|(i, c)| (T0 + i * 30, *c))
            .collect()
    }

    fn open_bounds() -> FillBounds {
        FillBounds {
            commitment_start: 0,
            commitment_end: u64::MAX,
            now: T0 + 10_000,
        }
    }

    fn span(buckets: u64, count: u64) -> ReportSpan {
        ReportSpan {
            start: T0,
            end: T0 + buckets * 30,
            count,
        }
    }

    fn as_vec(fills: &BTreeMap<u64, u64>, base: &[u64]) -> Vec<u64> {
        (0_u64..)
            .zip(base)
            .map(|(i, c)| c + fills.get(&(T0 + i * 30)).copied().unwrap_or(0))
            .collect()
    }

    #[test]
    fn surplus_fills_empty_buckets() {
        let base = [10, 10, 0, 0];
        let fills = distribute(
            span(4, 120),
            &existing(&base),
            &open_bounds(),
            &FillPolicy::default(),
        );
        assert_eq!(as_vec(&fills, &base), vec![10, 10, 50, 50]);
    }

    #[test]
    fn no_empty_bucket_discards_surplus() {
        let base = [10, 10, 10, 1];
        let fills = distribute(
            span(4, 130),
            &existing(&base),
            &open_bounds(),
            &FillPolicy::default(),
        );
        assert!(fills.is_empty());
    }

    #[test]
    fn cap_limits_absorbed_surplus() {
        let base = [0, 0];
        let fills = distribute(
            span(2, 200),
            &existing(&base),
            &open_bounds(),
            &FillPolicy {
                cap: 90,
                overflow: OverflowPolicy::Discard,
            },
        );
        assert_eq!(as_vec(&fills, &base), vec![90, 90]);
    }

    #[test]
    fn remainder_goes_to_earliest_buckets() {
        let base = [0, 0, 0, 0];
        let fills = distribute(
            span(4, 10),
            &existing(&base),
            &open_bounds(),
            &FillPolicy::default(),
        );
        assert_eq!(as_vec(&fills, &base), vec![3, 3, 2, 2]);
    }

    #[test]
    fn small_surplus_skips_zero_fills() {
        let base = [0, 0, 0, 0];
        let fills = distribute(
            span(4, 2),
            &existing(&base),
            &open_bounds(),
            &FillPolicy::default(),
        );
        assert_eq!(fills.len(), 2);
        assert_eq!(as_vec(&fills, &base), vec![1, 1, 0, 0]);
    }

    #[test]
    fn phone_already_covers_report() {
        let base = [40, 40, 0];
        let fills = distribute(
            span(3, 80),
            &existing(&base),
            &open_bounds(),
            &FillPolicy::default(),
        );
        assert!(fills.is_empty());
    }

    #[test]
    fn empty_or_inverted_reports_yield_nothing() {
        let bounds = open_bounds();
        let policy = FillPolicy::default();
        let none = BTreeMap::new();
        assert!(distribute(span(4, 0), &none, &bounds, &policy).is_empty());
        let inverted = ReportSpan {
            start: T0 + 60,
            end: T0,
            count: 50,
        };
        assert!(distribute(inverted, &none, &bounds, &policy).is_empty());
    }

    #[test]
    fn commitment_boundary_clamps_buckets_but_not_count() {
        // Report spans 6 buckets; only the last 3 are inside the window.
        let bounds = FillBounds {
            commitment_start: T0 + 90,
            commitment_end: T0 + 1000,
            now: T0 + 10_000,
        };
        let fills = distribute(span(6, 60), &BTreeMap::new(), &bounds, &FillPolicy::default());

        assert_eq!(fills.len(), 3);
        assert!(fills.keys().all(|k| *k >= T0 + 90));
        assert_eq!(fills.values().sum::<u64>(), 60);
    }

    #[test]
    fn open_bucket_is_never_filled() {
        let bounds = FillBounds {
            commitment_start: 0,
            commitment_end: u64::MAX,
            now: T0 + 75,
        };
        let fills = distribute(span(4, 40), &BTreeMap::new(), &bounds, &FillPolicy::default());
        assert_eq!(fills.keys().copied().collect::<Vec<_>>(), vec![T0, T0 + 30]);
        assert_eq!(fills.values().sum::<u64>(), 40);
    }

    #[test]
    fn report_entirely_outside_window_yields_nothing() {
        let bounds = FillBounds {
            commitment_start: T0 + 600,
            commitment_end: T0 + 1200,
            now: T0 + 10_000,
        };
        let fills = distribute(span(4, 100), &BTreeMap::new(), &bounds, &FillPolicy::default());
        assert!(fills.is_empty());
    }

    #[test]
    fn dump_policy_moves_overflow_to_last_bucket() {
        let policy = FillPolicy {
            cap: 90,
            overflow: OverflowPolicy::DumpIntoLastBucket,
        };

        let base = [0, 0];
        let fills = distribute(span(2, 200), &existing(&base), &open_bounds(), &policy);
        assert_eq!(as_vec(&fills, &base), vec![90, 110]);

        let base = [10, 10, 10, 1];
        let fills = distribute(span(4, 130), &existing(&base), &open_bounds(), &policy);
        assert_eq!(as_vec(&fills, &base), vec![10, 10, 10, 100]);
    }

    #[test]
    fn huge_count_dumps_without_overflow() {
        let policy = FillPolicy {
            cap: 90,
            overflow: OverflowPolicy::DumpIntoLastBucket,
        };
        let base = [0, 0];
        let fills = distribute(span(2, u64::MAX), &existing(&base), &open_bounds(), &policy);
        assert_eq!(as_vec(&fills, &base), vec![90, u64::MAX - 90]);
    }

    #[test]
    fn unaligned_report_touches_partial_buckets() {
        let report = ReportSpan {
            start: T0 + 15,
            end: T0 + 75,
            count: 30,
        };
        let fills = distribute(report, &BTreeMap::new(), &open_bounds(), &FillPolicy::default());
        assert_eq!(
            fills,
            BTreeMap::from([(T0, 10), (T0 + 30, 10), (T0 + 60, 10)])
        );
    }
}
