//! Commitment windows.
//!
//! Windows are supplied by an external scheduler. This module only normalizes
//! them (sort-and-sweep union, with touching windows merged) and answers which
//! window, if any, is active at a given instant.

use serde::{Deserialize, Serialize};

/// A half-open commitment window `[start, end)` in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActiveWindow {
    /// Inclusive start.
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
}

impl ActiveWindow {
    /// Creates a window.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Returns `true` if `instant` falls inside the window.
    #[must_use]
    pub const fn contains(&self, instant: u64) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Returns `true` if the window covers no time.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Resolves the commitment window active at an instant.
pub trait ActiveWindowProvider: Send + Sync {
    /// Returns the window containing `instant`, or `None` when reconciliation
    /// should be skipped.
    fn active_window_at(&self, instant: u64) -> Option<ActiveWindow>;
}

/// A normalized, non-overlapping, ascending set of windows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSet {
    windows: Vec<ActiveWindow>,
}

impl WindowSet {
    /// Builds a set from arbitrary windows, dropping empty ones and merging
    /// any that overlap or touch.
    #[must_use]
    pub fn new(windows: impl IntoIterator<Item = ActiveWindow>) -> Self {
        Self {
            windows: merge_windows(windows),
        }
    }

    /// Returns the normalized windows.
    #[must_use]
    pub fn windows(&self) -> &[ActiveWindow] {
        &self.windows
    }

    /// Returns `true` if the set holds no windows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drops windows that ended at or before `cutoff`.
    pub fn retain_after(&mut self, cutoff: u64) {
        self.windows.retain(|w| w.end > cutoff);
    }
}

impl ActiveWindowProvider for WindowSet {
    fn active_window_at(&self, instant: u64) -> Option<ActiveWindow> {
        // Windows are sorted and disjoint, so the candidate is the last one
        // starting at or before `instant`.
        let idx = self.windows.partition_point(|w| w.start <= instant);
        idx.checked_sub(1)
            .map(|i| self.windows[i])
            .filter(|w| w.contains(instant))
    }
}

/// Sort-and-sweep union of `windows`. Windows where `end == start` of the
/// next are merged; empty or inverted windows are dropped.
#[must_use]
pub fn merge_windows(windows: impl IntoIterator<Item = ActiveWindow>) -> Vec<ActiveWindow> {
    let mut sorted: Vec<ActiveWindow> = windows.into_iter().filter(|w| !w.is_empty()).collect();
    sorted.sort_unstable();

    let mut merged: Vec<ActiveWindow> = Vec::with_capacity(sorted.len());
    for window in sorted {
        match merged.last_mut() {
            Some(last) if window.start <= last.end => {
                last.end = last.end.max(window.end);
            },
            _ => merged.push(window),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_overlapping_and_adjacent() {
        let merged = merge_windows([
            ActiveWindow::new(300, 400),
            ActiveWindow::new(0, 100),
            ActiveWindow::new(100, 150),
            ActiveWindow::new(120, 200),
            ActiveWindow::new(390, 500),
        ]);
        assert_eq!(
            merged,
            vec![ActiveWindow::new(0, 200), ActiveWindow::new(300, 500)]
        );
    }

    #[test]
    fn merge_drops_empty_and_inverted() {
        let merged = merge_windows([
            ActiveWindow::new(50, 50),
            ActiveWindow::new(90, 10),
            ActiveWindow::new(0, 30),
        ]);
        assert_eq!(merged, vec![ActiveWindow::new(0, 30)]);
    }

    #[test]
    fn merge_keeps_contained_window_bounds() {
        let merged = merge_windows([ActiveWindow::new(0, 1000), ActiveWindow::new(10, 20)]);
        assert_eq!(merged, vec![ActiveWindow::new(0, 1000)]);
    }

    #[test]
    fn active_window_lookup() {
        let set = WindowSet::new([ActiveWindow::new(100, 200), ActiveWindow::new(400, 500)]);

        assert_eq!(set.active_window_at(99), None);
        assert_eq!(set.active_window_at(100), Some(ActiveWindow::new(100, 200)));
        assert_eq!(set.active_window_at(199), Some(ActiveWindow::new(100, 200)));
        assert_eq!(set.active_window_at(200), None);
        assert_eq!(set.active_window_at(450), Some(ActiveWindow::new(400, 500)));
        assert_eq!(set.active_window_at(900), None);
    }

    #[test]
    fn retain_after_filters_finished_windows() {
        let mut set = WindowSet::new([
            ActiveWindow::new(0, 100),
            ActiveWindow::new(200, 300),
            ActiveWindow::new(400, 500),
        ]);
        set.retain_after(300);
        assert_eq!(set.windows(), &[ActiveWindow::new(400, 500)]);
        assert!(!set.is_empty());
    }
}
