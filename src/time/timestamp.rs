// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Timestamp with bounded uncertainty interval and two comparison modes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of comparing two timestamps under uncertainty.
///
/// When the uncertainty windows of two timestamps overlap, neither event can
/// be said to have happened first and the comparison yields `Concurrent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncertainOrder {
    /// This timestamp's window lies entirely before the other's.
    Before,
    /// This timestamp's window lies entirely after the other's.
    After,
    /// The windows overlap; causal order is ambiguous.
    Concurrent,
}

/// A timestamp issued by the timestamp oracle.
///
/// Represents an interval `[earliest, latest]` (nanoseconds since Unix epoch)
/// within which the true time lies, tagged with the id of the oracle instance
/// that issued it.
///
/// Two comparison modes are provided:
///
/// - **certain** ([`Timestamp::compare_certain`], also the `Ord` impl): a
///   total order over `(latest, origin)`. Snapshot-isolation visibility and
///   conflict arbitration use this mode exclusively.
/// - **uncertain** ([`Timestamp::compare_uncertain`]): interval comparison
///   where overlapping windows yield [`UncertainOrder::Concurrent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    earliest: u64,
    latest: u64,
    origin: u32,
}

impl Timestamp {
    /// The zero timestamp; compares certain-before every oracle-issued one.
    pub const ZERO: Timestamp = Timestamp {
        earliest: 0,
        latest: 0,
        origin: 0,
    };

    /// Creates a new timestamp with the given bounds.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `earliest > latest`.
    #[inline]
    pub fn new(earliest: u64, latest: u64) -> Self {
        debug_assert!(earliest <= latest, "earliest must be <= latest");
        Self {
            earliest,
            latest,
            origin: 0,
        }
    }

    /// Creates a timestamp from a single point with zero uncertainty.
    #[inline]
    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            earliest: nanos,
            latest: nanos,
            origin: 0,
        }
    }

    /// Creates a timestamp from a point with symmetric uncertainty.
    #[inline]
    pub fn with_uncertainty(point: u64, uncertainty_nanos: u64) -> Self {
        Self {
            earliest: point.saturating_sub(uncertainty_nanos),
            latest: point.saturating_add(uncertainty_nanos),
            origin: 0,
        }
    }

    /// Tags the timestamp with the issuing oracle's id.
    #[inline]
    pub fn with_origin(mut self, origin: u32) -> Self {
        self.origin = origin;
        self
    }

    /// Returns the earliest possible true time.
    #[inline]
    pub fn earliest(&self) -> u64 {
        self.earliest
    }

    /// Returns the latest possible true time.
    #[inline]
    pub fn latest(&self) -> u64 {
        self.latest
    }

    /// Returns the id of the oracle instance that issued this timestamp.
    #[inline]
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Returns the uncertainty as a Duration (half-width of the interval).
    #[inline]
    pub fn uncertainty(&self) -> Duration {
        Duration::from_nanos((self.latest - self.earliest) / 2)
    }

    /// Compares two timestamps in certain mode.
    ///
    /// A total order over `(latest, origin)`: a given oracle never issues two
    /// timestamps with the same `latest`, and distinct oracles are ordered by
    /// their id. This is the comparison all visibility and conflict decisions
    /// are made with.
    #[inline]
    pub fn compare_certain(&self, other: &Timestamp) -> std::cmp::Ordering {
        self.latest
            .cmp(&other.latest)
            .then(self.origin.cmp(&other.origin))
            .then(self.earliest.cmp(&other.earliest))
    }

    /// Compares two timestamps in uncertain mode.
    ///
    /// Identical timestamps have coinciding windows and compare `Concurrent`.
    pub fn compare_uncertain(&self, other: &Timestamp) -> UncertainOrder {
        if self.latest < other.earliest {
            UncertainOrder::Before
        } else if self.earliest > other.latest {
            UncertainOrder::After
        } else {
            UncertainOrder::Concurrent
        }
    }

    /// Returns true if this timestamp's interval is entirely before the other's.
    #[inline]
    pub fn definitely_before(&self, other: &Timestamp) -> bool {
        self.compare_uncertain(other) == UncertainOrder::Before
    }

    /// Returns the timestamp shifted back by `window`, saturating at zero.
    ///
    /// Used to derive the retention horizon from the current oracle time.
    #[inline]
    pub fn sub_window(&self, window: Duration) -> Timestamp {
        let nanos = window.as_nanos() as u64;
        Timestamp {
            earliest: self.earliest.saturating_sub(nanos),
            latest: self.latest.saturating_sub(nanos),
            origin: self.origin,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.compare_certain(other)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]@{}", self.earliest, self.latest, self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_certain_total_order() {
        let t1 = Timestamp::from_nanos(100);
        let t2 = Timestamp::from_nanos(200);
        assert_eq!(t1.compare_certain(&t2), Ordering::Less);
        assert_eq!(t2.compare_certain(&t1), Ordering::Greater);
        assert_eq!(t1.compare_certain(&t1), Ordering::Equal);
    }

    #[test]
    fn test_certain_origin_tiebreak() {
        let a = Timestamp::from_nanos(100).with_origin(1);
        let b = Timestamp::from_nanos(100).with_origin(2);
        assert_eq!(a.compare_certain(&b), Ordering::Less);
        assert_eq!(b.compare_certain(&a), Ordering::Greater);
    }

    #[test]
    fn test_uncertain_before_after() {
        let t1 = Timestamp::new(100, 200);
        let t2 = Timestamp::new(300, 400);
        assert_eq!(t1.compare_uncertain(&t2), UncertainOrder::Before);
        assert_eq!(t2.compare_uncertain(&t1), UncertainOrder::After);
        assert!(t1.definitely_before(&t2));
    }

    #[test]
    fn test_uncertain_overlap_is_concurrent() {
        let t1 = Timestamp::new(100, 300);
        let t2 = Timestamp::new(200, 400);
        assert_eq!(t1.compare_uncertain(&t2), UncertainOrder::Concurrent);
        assert_eq!(t2.compare_uncertain(&t1), UncertainOrder::Concurrent);
    }

    #[test]
    fn test_identical_timestamps_concurrent() {
        let t = Timestamp::new(100, 200);
        assert_eq!(t.compare_uncertain(&t), UncertainOrder::Concurrent);
    }

    #[test]
    fn test_ord_matches_certain() {
        let t1 = Timestamp::from_nanos(100);
        let t2 = Timestamp::from_nanos(200);
        assert!(t1 < t2);
        assert_eq!(t1.max(t2), t2);
    }

    #[test]
    fn test_sub_window() {
        let t = Timestamp::new(1_000, 1_100);
        let back = t.sub_window(Duration::from_nanos(300));
        assert_eq!(back.earliest(), 700);
        assert_eq!(back.latest(), 800);
    }

    #[test]
    fn test_sub_window_saturates() {
        let t = Timestamp::new(10, 20);
        let back = t.sub_window(Duration::from_nanos(100));
        assert_eq!(back.earliest(), 0);
        assert_eq!(back.latest(), 0);
    }

    #[test]
    fn test_with_uncertainty() {
        let ts = Timestamp::with_uncertainty(1000, 50);
        assert_eq!(ts.earliest(), 950);
        assert_eq!(ts.latest(), 1050);
    }

    #[test]
    fn test_zero_precedes_everything() {
        let ts = Timestamp::from_nanos(1);
        assert!(Timestamp::ZERO < ts);
    }
}
