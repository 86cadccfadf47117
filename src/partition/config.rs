// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Partition configuration.

use std::time::Duration;

/// Tunables of one partition instance.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Horizon before which operations are rejected and versions may be
    /// garbage-collected.
    pub retention_window: Duration,
    /// Cadence at which clients are expected to heartbeat; also the cadence
    /// of the expiry watchdog tick.
    pub heartbeat_interval: Duration,
    /// How long a transaction may go without a heartbeat before it is
    /// force-aborted.
    pub txn_expiry: Duration,
    /// Read cache entry capacity.
    pub read_cache_size: usize,
    /// Query page byte budget.
    pub scan_page_bytes: usize,
    /// Query page row budget.
    pub scan_page_rows: usize,
    /// Maximum PUSH retries per operation.
    pub push_retry_max: usize,
    /// Appends batched before the log forces a fence on its own.
    pub persistence_flush_batch: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(24 * 3600),
            heartbeat_interval: Duration::from_millis(500),
            txn_expiry: Duration::from_secs(10),
            read_cache_size: 10_000,
            scan_page_bytes: 1024 * 1024,
            scan_page_rows: 128,
            push_retry_max: 1,
            persistence_flush_batch: 32,
        }
    }
}

impl PartitionConfig {
    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_txn_expiry(mut self, expiry: Duration) -> Self {
        self.txn_expiry = expiry;
        self
    }

    pub fn with_read_cache_size(mut self, size: usize) -> Self {
        self.read_cache_size = size;
        self
    }

    pub fn with_scan_page(mut self, bytes: usize, rows: usize) -> Self {
        self.scan_page_bytes = bytes;
        self.scan_page_rows = rows;
        self
    }

    pub fn with_push_retry_max(mut self, retries: usize) -> Self {
        self.push_retry_max = retries;
        self
    }

    pub fn with_persistence_flush_batch(mut self, batch: usize) -> Self {
        self.persistence_flush_batch = batch;
        self
    }
}
