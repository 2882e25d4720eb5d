//! Interval Ledger
//!
//! Authoritative record of which portions of one video have been watched.
//! Reported play spans are merged into a sorted set of disjoint ranges so that
//! replayed, duplicated or out-of-order telemetry never grows the covered
//! duration twice.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("play range end {end} precedes start {start}")]
    Inverted { start: f64, end: f64 },

    #[error("play range [{start}, {end}] has a negative or non-finite bound")]
    OutOfBounds { start: f64, end: f64 },
}

/// One contiguous watched segment, in seconds of media time.
///
/// Persisted as a `[start, end]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, f64)", into = "(f64, f64)")]
pub struct PlayRange {
    start: f64,
    end: f64,
}

impl PlayRange {
    /// Build a validated range. `start == end` is allowed here and treated as
    /// a no-op by [`PlaybackLedger::add`].
    pub fn new(start: f64, end: f64) -> Result<Self, LedgerError> {
        if !start.is_finite() || !end.is_finite() || start < 0.0 {
            return Err(LedgerError::OutOfBounds { start, end });
        }
        if end < start {
            return Err(LedgerError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl TryFrom<(f64, f64)> for PlayRange {
    type Error = LedgerError;

    fn try_from((start, end): (f64, f64)) -> Result<Self, Self::Error> {
        PlayRange::new(start, end)
    }
}

impl From<PlayRange> for (f64, f64) {
    fn from(range: PlayRange) -> Self {
        (range.start, range.end)
    }
}

/// Sorted, disjoint, non-adjacent play ranges for one video.
///
/// Invariant: `ranges[i].end < ranges[i + 1].start` for every `i`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PlaybackLedger {
    ranges: Vec<PlayRange>,
}

impl PlaybackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from ranges of unknown shape (e.g. read back from
    /// storage), re-establishing the invariant by merging them one by one.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = PlayRange>,
    {
        let mut ledger = Self::new();
        for range in ranges {
            ledger.merge(range);
        }
        ledger
    }

    /// Merge `[start, end]` into the ledger.
    ///
    /// Returns whether the covered set changed. Malformed input is rejected
    /// and leaves the ledger untouched.
    pub fn add(&mut self, start: f64, end: f64) -> Result<bool, LedgerError> {
        let range = PlayRange::new(start, end)?;
        Ok(self.merge(range))
    }

    fn merge(&mut self, range: PlayRange) -> bool {
        if range.is_empty() {
            return false;
        }

        // ranges[lo..hi] are exactly those overlapping or touching `range`
        let lo = self.ranges.partition_point(|r| r.end < range.start);
        let hi = self.ranges.partition_point(|r| r.start <= range.end);

        if lo == hi {
            self.ranges.insert(lo, range);
            return true;
        }

        let first = self.ranges[lo];
        let last = self.ranges[hi - 1];
        if hi - lo == 1 && first.start <= range.start && first.end >= range.end {
            return false;
        }

        let merged = PlayRange {
            start: first.start.min(range.start),
            end: last.end.max(range.end),
        };
        self.ranges.splice(lo..hi, std::iter::once(merged));
        true
    }

    pub fn ranges(&self) -> &[PlayRange] {
        &self.ranges
    }

    pub fn total_duration(&self) -> f64 {
        total_duration(&self.ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl<'de> Deserialize<'de> for PlaybackLedger {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ranges = Vec::<PlayRange>::deserialize(deserializer)?;
        Ok(PlaybackLedger::from_ranges(ranges))
    }
}

/// Covered duration of a ledger snapshot.
pub fn total_duration(ranges: &[PlayRange]) -> f64 {
    ranges.iter().map(PlayRange::duration).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(ledger: &PlaybackLedger) -> Vec<(f64, f64)> {
        ledger.ranges().iter().map(|r| (r.start(), r.end())).collect()
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(0.0, 5.0).unwrap();
        ledger.add(5.0, 10.0).unwrap();

        let mut single = PlaybackLedger::new();
        single.add(0.0, 10.0).unwrap();

        assert_eq!(pairs(&ledger), vec![(0.0, 10.0)]);
        assert_eq!(ledger.total_duration(), 10.0);
        assert_eq!(ledger, single);
    }

    #[test]
    fn test_contained_range_is_noop() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(0.0, 10.0).unwrap();
        let changed = ledger.add(2.0, 6.0).unwrap();

        assert!(!changed);
        assert_eq!(ledger.total_duration(), 10.0);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(3.0, 7.0).unwrap();
        assert!(!ledger.add(3.0, 7.0).unwrap());
        assert_eq!(pairs(&ledger), vec![(3.0, 7.0)]);
    }

    #[test]
    fn test_disjoint_insert_keeps_order() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(20.0, 25.0).unwrap();
        ledger.add(0.0, 2.0).unwrap();
        ledger.add(10.0, 12.0).unwrap();

        assert_eq!(pairs(&ledger), vec![(0.0, 2.0), (10.0, 12.0), (20.0, 25.0)]);
        assert_eq!(ledger.total_duration(), 9.0);
    }

    #[test]
    fn test_bridge_absorbs_several_ranges() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(0.0, 2.0).unwrap();
        ledger.add(4.0, 6.0).unwrap();
        ledger.add(8.0, 10.0).unwrap();
        ledger.add(30.0, 31.0).unwrap();

        ledger.add(1.0, 9.0).unwrap();

        assert_eq!(pairs(&ledger), vec![(0.0, 10.0), (30.0, 31.0)]);
    }

    #[test]
    fn test_partial_overlap_extends_range() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(5.0, 10.0).unwrap();
        ledger.add(2.0, 7.0).unwrap();
        ledger.add(9.0, 14.0).unwrap();

        assert_eq!(pairs(&ledger), vec![(2.0, 14.0)]);
    }

    #[test]
    fn test_empty_range_is_noop() {
        let mut ledger = PlaybackLedger::new();
        assert!(!ledger.add(4.0, 4.0).unwrap());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_malformed_ranges_rejected() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(0.0, 1.0).unwrap();

        assert!(matches!(ledger.add(5.0, 3.0), Err(LedgerError::Inverted { .. })));
        assert!(matches!(ledger.add(-1.0, 3.0), Err(LedgerError::OutOfBounds { .. })));
        assert!(matches!(ledger.add(0.0, f64::NAN), Err(LedgerError::OutOfBounds { .. })));
        assert!(matches!(
            ledger.add(0.0, f64::INFINITY),
            Err(LedgerError::OutOfBounds { .. })
        ));
        assert_eq!(pairs(&ledger), vec![(0.0, 1.0)]);
    }

    #[test]
    fn test_persisted_form_is_pairs() {
        let mut ledger = PlaybackLedger::new();
        ledger.add(0.0, 1.5).unwrap();
        ledger.add(3.0, 4.0).unwrap();

        let json = serde_json::to_string(&ledger).unwrap();
        assert_eq!(json, "[[0.0,1.5],[3.0,4.0]]");
    }

    #[test]
    fn test_deserialize_repairs_overlapping_input() {
        let ledger: PlaybackLedger = serde_json::from_str("[[4,6],[0,2],[1,4]]").unwrap();
        assert_eq!(pairs(&ledger), vec![(0.0, 6.0)]);

        let bad = serde_json::from_str::<PlaybackLedger>("[[4,2]]");
        assert!(bad.is_err());
    }
}
