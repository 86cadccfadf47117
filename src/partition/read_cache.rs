// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Interval read cache: highest read timestamp observed per key range.
//!
//! The write path consults this cache to enforce write-no-earlier-than-reads.
//! The cache is size-bounded; evicting an entry folds its timestamp into a
//! global floor, so after eviction every range reports at least the floor.
//! Overestimating a read time only causes false conflicts; underestimating
//! would break snapshot isolation, so the floor never decreases.

use crate::schema::Key;
use crate::time::Timestamp;

struct CacheEntry {
    lo: Key,
    hi: Key,
    ts: Timestamp,
    last_used: u64,
}

impl CacheEntry {
    #[inline]
    fn overlaps(&self, lo: &Key, hi: &Key) -> bool {
        // inclusive ranges; a point read is [k, k]
        self.lo <= *hi && *lo <= self.hi
    }
}

/// Size-bounded interval-keyed max-timestamp store.
pub struct ReadCache {
    entries: Vec<CacheEntry>,
    capacity: usize,
    floor: Timestamp,
    tick: u64,
}

impl ReadCache {
    /// Creates a cache with the given entry capacity and initial floor.
    ///
    /// The floor starts at the partition's retention horizon: anything below
    /// it is unwritable anyway.
    pub fn new(capacity: usize, floor: Timestamp) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
            floor,
            tick: 0,
        }
    }

    /// Returns the maximum read timestamp recorded over any interval
    /// overlapping `[lo, hi]`, floored by the eviction floor.
    pub fn check_interval(&mut self, lo: &Key, hi: &Key) -> Timestamp {
        self.tick += 1;
        let tick = self.tick;
        let mut max = self.floor;
        for entry in &mut self.entries {
            if entry.overlaps(lo, hi) {
                entry.last_used = tick;
                max = max.max(entry.ts);
            }
        }
        max
    }

    /// Records a read of `[lo, hi]` at `ts`.
    pub fn mark_interval(&mut self, lo: Key, hi: Key, ts: Timestamp) {
        self.tick += 1;
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.lo == lo && e.hi == hi)
        {
            entry.ts = entry.ts.max(ts);
            entry.last_used = self.tick;
            return;
        }
        self.entries.push(CacheEntry {
            lo,
            hi,
            ts,
            last_used: self.tick,
        });
        if self.entries.len() > self.capacity {
            self.evict_one();
        }
    }

    /// Convenience for point reads.
    pub fn mark_key(&mut self, key: &Key, ts: Timestamp) {
        self.mark_interval(key.clone(), key.clone(), ts);
    }

    /// Point-read variant of [`ReadCache::check_interval`].
    pub fn check_key(&mut self, key: &Key) -> Timestamp {
        self.check_interval(&key.clone(), key)
    }

    /// The conservative floor every range reports at least.
    pub fn floor(&self) -> Timestamp {
        self.floor
    }

    fn evict_one(&mut self) {
        if let Some(idx) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i)
        {
            let evicted = self.entries.swap_remove(idx);
            self.floor = self.floor.max(evicted.ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pk: &str) -> Key {
        Key::new("s", pk, "")
    }

    fn cache(capacity: usize) -> ReadCache {
        ReadCache::new(capacity, Timestamp::ZERO)
    }

    #[test]
    fn test_point_mark_and_check() {
        let mut rc = cache(16);
        rc.mark_key(&key("a"), Timestamp::from_nanos(100));
        assert_eq!(rc.check_key(&key("a")).latest(), 100);
        assert_eq!(rc.check_key(&key("b")).latest(), 0);
    }

    #[test]
    fn test_interval_overlap() {
        let mut rc = cache(16);
        rc.mark_interval(key("b"), key("d"), Timestamp::from_nanos(100));
        assert_eq!(rc.check_key(&key("c")).latest(), 100);
        assert_eq!(rc.check_key(&key("b")).latest(), 100);
        assert_eq!(rc.check_key(&key("d")).latest(), 100);
        assert_eq!(rc.check_key(&key("e")).latest(), 0);
    }

    #[test]
    fn test_max_over_overlapping_marks() {
        let mut rc = cache(16);
        rc.mark_key(&key("a"), Timestamp::from_nanos(100));
        rc.mark_key(&key("a"), Timestamp::from_nanos(50));
        assert_eq!(rc.check_key(&key("a")).latest(), 100, "never decreases");

        rc.mark_interval(key("a"), key("z"), Timestamp::from_nanos(200));
        assert_eq!(rc.check_key(&key("a")).latest(), 200);
    }

    #[test]
    fn test_eviction_raises_floor() {
        let mut rc = cache(2);
        rc.mark_key(&key("a"), Timestamp::from_nanos(100));
        rc.mark_key(&key("b"), Timestamp::from_nanos(200));
        rc.mark_key(&key("c"), Timestamp::from_nanos(300)); // evicts "a"

        // the evicted range still reports at least its marked time
        assert!(rc.check_key(&key("a")).latest() >= 100);
        // unmarked keys now report the floor too (conservative)
        assert!(rc.check_key(&key("zz")).latest() >= 100);
    }

    #[test]
    fn test_initial_floor() {
        let mut rc = ReadCache::new(4, Timestamp::from_nanos(500));
        assert_eq!(rc.check_key(&key("anything")).latest(), 500);
    }

    #[test]
    fn test_lru_eviction_prefers_stale_entries() {
        let mut rc = cache(2);
        rc.mark_key(&key("a"), Timestamp::from_nanos(100));
        rc.mark_key(&key("b"), Timestamp::from_nanos(50));
        rc.check_key(&key("a")); // touch "a" so "b" is the LRU entry
        rc.mark_key(&key("c"), Timestamp::from_nanos(10)); // evicts "b"

        // "a" is still tracked exactly; floor only absorbed "b"
        assert_eq!(rc.check_key(&key("a")).latest(), 100);
        assert_eq!(rc.floor().latest(), 50);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn key(pk: u8) -> Key {
        Key::new("s", format!("{pk:03}"), "")
    }

    proptest! {
        // Monotonicity: a check over a marked range never under-reports,
        // regardless of capacity pressure and eviction order.
        #[test]
        fn check_never_under_reports(
            marks in prop::collection::vec((0u8..20, 0u8..20, 1u64..10_000), 1..60),
            capacity in 1usize..8,
        ) {
            let mut rc = ReadCache::new(capacity, Timestamp::ZERO);
            let mut expected: Vec<(Key, Key, u64)> = Vec::new();

            for (a, b, ts) in marks {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                rc.mark_interval(key(lo), key(hi), Timestamp::from_nanos(ts));
                expected.push((key(lo), key(hi), ts));
            }

            for (lo, hi, ts) in &expected {
                let got = rc.check_interval(lo, hi);
                prop_assert!(
                    got.latest() >= *ts,
                    "marked {} but checked {}", ts, got.latest()
                );
            }
        }

        #[test]
        fn floor_never_decreases(
            marks in prop::collection::vec((0u8..10, 1u64..10_000), 1..60),
        ) {
            let mut rc = ReadCache::new(2, Timestamp::ZERO);
            let mut last_floor = rc.floor();
            for (k, ts) in marks {
                rc.mark_key(&key(k), Timestamp::from_nanos(ts));
                prop_assert!(rc.floor() >= last_floor);
                last_floor = rc.floor();
            }
        }
    }
}
