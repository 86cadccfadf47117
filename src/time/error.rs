// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Time service error types.

/// Errors that can occur when obtaining timestamps.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("timestamp oracle unavailable: {0}")]
    Unavailable(String),

    #[error("timestamp oracle issued a non-monotonic batch (last seen {last}, got {got})")]
    NonMonotonicBatch { last: u64, got: u64 },
}
