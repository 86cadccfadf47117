// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! CesiumKV: the transactional partition core of a distributed key-value
//! store.
//!
//! A cluster is sharded into partitions, each owning a contiguous key range
//! of a named collection. This crate implements the per-partition
//! transaction engine: snapshot-isolated MVCC reads and writes over a
//! versioned indexer, a write-intent lifecycle driven by a transaction
//! record holder (TRH), a read cache enforcing write-no-earlier-than-reads,
//! and the PUSH protocol that deterministically arbitrates conflicts
//! between concurrent transactions.
//!
//! Timestamps come from an external oracle behind the [`time::Clock`]
//! facade; partition location comes from a control-plane facade; durability
//! goes through an append-only log with a flush fence. All three are
//! injected trait dependencies.

pub mod partition;
pub mod persistence;
pub mod protocol;
pub mod schema;
pub mod time;
pub mod txn;

pub use partition::{PartitionClient, PartitionConfig, PartitionHost, PartitionModule};
pub use persistence::{FileLog, LogRecord, Persistence};
pub use protocol::{Deadline, PartitionLocator, PartitionMeta, Status, TxnTransport};
pub use schema::{FieldType, FieldValue, Key, Record, Schema, SchemaField};
pub use time::{Clock, LogicalOracle, SystemOracle, Timestamp, TimestampOracle};
pub use txn::{EndAction, Mtr, Priority, TxnId, TxnState};
