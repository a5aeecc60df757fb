//! Per-tick deltas from the device's cumulative step counter.

/// Outcome of comparing a counter reading against the previous baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhoneDelta {
    /// Steps credited for this tick.
    pub delta: u64,
    /// Baseline to use on the next tick.
    pub baseline: u64,
}

/// Computes the delta between `current` and `previous`.
///
/// The first reading only establishes a baseline. A reading below the
/// baseline means the counter was reset (device reboot): nothing is credited
/// and the baseline restarts from `current`. Steps taken between the last
/// reading and the reset are lost.
#[must_use]
pub const fn phone_delta(current: u64, previous: Option<u64>) -> PhoneDelta {
    match previous {
        Some(previous) if current >= previous => PhoneDelta {
            delta: current - previous,
            baseline: current,
        },
        _ => PhoneDelta {
            delta: 0,
            baseline: current,
        },
    }
}

/// Owns the counter baseline across ticks of one tracking session.
#[derive(Debug, Clone, Default)]
pub struct PhoneDeltaComputer {
    baseline: Option<u64>,
}

impl PhoneDeltaComputer {
    /// Creates a computer with no baseline.
    #[must_use]
    pub const fn new() -> Self {
        Self { baseline: None }
    }

    /// Feeds the latest counter reading and returns the steps to credit.
    pub fn observe(&mut self, current: u64) -> u64 {
        let PhoneDelta { delta, baseline } = phone_delta(current, self.baseline);
        if self.baseline.is_some_and(|previous| current < previous) {
            tracing::info!(
                previous = self.baseline,
                current,
                "step counter regressed, re-baselining"
            );
        }
        self.baseline = Some(baseline);
        delta
    }

    /// Returns the current baseline.
    #[must_use]
    pub const fn baseline(&self) -> Option<u64> {
        self.baseline
    }

    /// Forgets the baseline; the next reading credits nothing.
    pub fn reset(&mut self) {
        self.baseline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reading_only_baselines() {
        assert_eq!(
            phone_delta(4200, None),
            PhoneDelta {
                delta: 0,
                baseline: 4200
            }
        );
    }

    #[test]
    fn increasing_counter_credits_difference() {
        assert_eq!(
            phone_delta(130, Some(100)),
            PhoneDelta {
                delta: 30,
                baseline: 130
            }
        );
        assert_eq!(phone_delta(100, Some(100)).delta, 0);
    }

    #[test]
    fn counter_reset_rebaselines_without_credit() {
        assert_eq!(
            phone_delta(100, Some(5000)),
            PhoneDelta {
                delta: 0,
                baseline: 100
            }
        );
    }

    #[test]
    fn computer_tracks_baseline_across_ticks() {
        let mut computer = PhoneDeltaComputer::new();
        assert_eq!(computer.observe(5000), 0);
        assert_eq!(computer.observe(5012), 12);
        assert_eq!(computer.observe(100), 0);
        assert_eq!(computer.baseline(), Some(100));
        assert_eq!(computer.observe(107), 7);

        computer.reset();
        assert_eq!(computer.baseline(), None);
        assert_eq!(computer.observe(200), 0);
    }
}
