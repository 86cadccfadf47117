// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Clock facade over the timestamp oracle.
//!
//! The oracle issues monotonic, globally-unique timestamps in batches; the
//! partition only ever asks the facade for a single `now()`. The facade
//! consumes batches lazily and guarantees that consecutive `now()` calls are
//! strictly increasing in certain order even if the oracle misbehaves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::TimeError;
use super::timestamp::Timestamp;

/// A contiguous run of timestamps reserved from the oracle.
///
/// The `i`-th timestamp of the batch is the point `base + i` with the batch's
/// uncertainty half-width applied.
#[derive(Debug, Clone, Copy)]
pub struct TimestampBatch {
    /// First reserved point, nanoseconds since Unix epoch.
    pub base: u64,
    /// Symmetric uncertainty applied to every timestamp in the batch.
    pub uncertainty_nanos: u64,
    /// Issuing oracle instance id.
    pub origin: u32,
    /// Number of timestamps reserved.
    pub count: u32,
}

impl TimestampBatch {
    /// Returns the `i`-th timestamp of the batch.
    #[inline]
    pub fn timestamp(&self, i: u32) -> Timestamp {
        debug_assert!(i < self.count);
        Timestamp::with_uncertainty(self.base + u64::from(i), self.uncertainty_nanos)
            .with_origin(self.origin)
    }
}

/// The timestamp oracle interface.
///
/// Implementations reserve `hint` (or more) consecutive timestamps per call.
/// Batches must be monotone: every timestamp of a later batch compares
/// certain-after every timestamp of an earlier one.
#[async_trait]
pub trait TimestampOracle: Send + Sync {
    async fn reserve(&self, hint: u32) -> Result<TimestampBatch, TimeError>;
}

struct ClockState {
    batch: Option<TimestampBatch>,
    next: u32,
    last_latest: u64,
}

/// Clock facade consuming oracle batches.
///
/// Process-scoped, injected into every partition. Cheap to clone via `Arc`.
pub struct Clock {
    oracle: Arc<dyn TimestampOracle>,
    batch_size: u32,
    state: Mutex<ClockState>,
}

impl Clock {
    /// Creates a clock over the given oracle, reserving `batch_size`
    /// timestamps per oracle round-trip.
    pub fn new(oracle: Arc<dyn TimestampOracle>, batch_size: u32) -> Self {
        Self {
            oracle,
            batch_size: batch_size.max(1),
            state: Mutex::new(ClockState {
                batch: None,
                next: 0,
                last_latest: 0,
            }),
        }
    }

    /// Returns the next timestamp.
    ///
    /// Strictly increasing in certain order across calls. Suspends only when
    /// the current batch is exhausted and a new one must be reserved.
    pub async fn now(&self) -> Result<Timestamp, TimeError> {
        loop {
            if let Some(ts) = self.take_from_batch() {
                return Ok(ts);
            }

            let batch = self.oracle.reserve(self.batch_size).await?;
            let mut state = self.state.lock();
            let first = batch.timestamp(0);
            if first.latest() <= state.last_latest {
                return Err(TimeError::NonMonotonicBatch {
                    last: state.last_latest,
                    got: first.latest(),
                });
            }
            state.batch = Some(batch);
            state.next = 0;
        }
    }

    fn take_from_batch(&self) -> Option<Timestamp> {
        let mut state = self.state.lock();
        let batch = state.batch?;
        if state.next >= batch.count {
            state.batch = None;
            return None;
        }
        let ts = batch.timestamp(state.next);
        state.next += 1;
        state.last_latest = ts.latest();
        Some(ts)
    }
}

/// System-clock-backed oracle for single-process deployments and tests.
///
/// Reserves batches off the local clock with a compare-and-swap loop so that
/// batches never overlap, even under concurrent reservation.
pub struct SystemOracle {
    last_reserved: AtomicU64,
    uncertainty: Duration,
    origin: u32,
}

impl SystemOracle {
    pub fn new(uncertainty: Duration, origin: u32) -> Self {
        Self {
            last_reserved: AtomicU64::new(0),
            uncertainty,
            origin,
        }
    }

    fn physical_time_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

impl Default for SystemOracle {
    fn default() -> Self {
        Self::new(Duration::from_micros(500), 0)
    }
}

#[async_trait]
impl TimestampOracle for SystemOracle {
    async fn reserve(&self, hint: u32) -> Result<TimestampBatch, TimeError> {
        let count = hint.max(1);
        loop {
            let physical = Self::physical_time_nanos();
            let last = self.last_reserved.load(Ordering::Acquire);
            let base = physical.max(last.saturating_add(1));
            let end = base + u64::from(count) - 1;

            match self.last_reserved.compare_exchange(
                last,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(TimestampBatch {
                        base,
                        uncertainty_nanos: self.uncertainty.as_nanos() as u64,
                        origin: self.origin,
                        count,
                    })
                }
                Err(_) => continue,
            }
        }
    }
}

/// Dense logical oracle with zero uncertainty, for deterministic tests.
pub struct LogicalOracle {
    next: AtomicU64,
    origin: u32,
}

impl LogicalOracle {
    pub fn new(origin: u32) -> Self {
        Self {
            next: AtomicU64::new(1),
            origin,
        }
    }

    /// Advances the oracle past `nanos` so the next timestamp exceeds it.
    pub fn advance_to(&self, nanos: u64) {
        self.next.fetch_max(nanos + 1, Ordering::AcqRel);
    }
}

impl Default for LogicalOracle {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl TimestampOracle for LogicalOracle {
    async fn reserve(&self, hint: u32) -> Result<TimestampBatch, TimeError> {
        let count = hint.max(1);
        let base = self.next.fetch_add(u64::from(count), Ordering::AcqRel);
        Ok(TimestampBatch {
            base,
            uncertainty_nanos: 0,
            origin: self.origin,
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_monotonic() {
        let clock = Clock::new(Arc::new(LogicalOracle::default()), 8);
        let mut last = clock.now().await.unwrap();
        for _ in 0..100 {
            let ts = clock.now().await.unwrap();
            assert!(last < ts, "clock must be strictly increasing");
            last = ts;
        }
    }

    #[tokio::test]
    async fn test_clock_spans_batches() {
        let clock = Clock::new(Arc::new(LogicalOracle::default()), 2);
        let a = clock.now().await.unwrap();
        let b = clock.now().await.unwrap();
        let c = clock.now().await.unwrap(); // forces a second batch
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_system_oracle_batches_disjoint() {
        let oracle = SystemOracle::default();
        let b1 = oracle.reserve(16).await.unwrap();
        let b2 = oracle.reserve(16).await.unwrap();
        assert!(b1.base + u64::from(b1.count) <= b2.base);
    }

    #[tokio::test]
    async fn test_logical_oracle_advance() {
        let oracle = LogicalOracle::default();
        oracle.advance_to(1_000);
        let batch = oracle.reserve(1).await.unwrap();
        assert!(batch.base > 1_000);
    }

    #[test]
    fn test_batch_indexing() {
        let batch = TimestampBatch {
            base: 100,
            uncertainty_nanos: 5,
            origin: 7,
            count: 3,
        };
        let ts = batch.timestamp(2);
        assert_eq!(ts.earliest(), 97);
        assert_eq!(ts.latest(), 107);
        assert_eq!(ts.origin(), 7);
    }
}
