// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Clock facade fed by the timestamp oracle (TSO).
//!
//! The oracle is an external service issuing monotonic, globally-unique
//! timestamps in batches. The partition consumes single timestamps through
//! [`Clock::now`]; everything else about time sources lives behind the
//! [`TimestampOracle`] trait.
//!
//! # Comparison modes
//!
//! [`Timestamp`] carries an uncertainty interval and supports two comparison
//! modes: *certain* (a total order, used for all snapshot-isolation
//! visibility and conflict decisions) and *uncertain* (interval overlap
//! yields [`UncertainOrder::Concurrent`]).

mod clock;
mod error;
mod timestamp;

pub use clock::{Clock, LogicalOracle, SystemOracle, TimestampBatch, TimestampOracle};
pub use error::TimeError;
pub use timestamp::{Timestamp, UncertainOrder};
