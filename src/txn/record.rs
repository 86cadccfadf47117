// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction identity and state types.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::schema::Key;
use crate::time::Timestamp;

/// Transaction priority. Higher values win conflict arbitration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(128);
    pub const HIGH: Priority = Priority(192);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

/// Meta-transaction record: the immutable cluster-wide identity of a
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mtr {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub id_hash: u64,
}

impl Mtr {
    pub fn new(timestamp: Timestamp, priority: Priority, id_hash: u64) -> Self {
        Self {
            timestamp,
            priority,
            id_hash,
        }
    }
}

impl std::fmt::Display for Mtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mtr({}, prio={}, hash={:#x})",
            self.timestamp, self.priority.0, self.id_hash
        )
    }
}

/// Full transaction identity: the MTR plus the routing key whose owning
/// partition is the transaction record holder (TRH).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId {
    pub collection: String,
    pub trh_key: Key,
    pub mtr: Mtr,
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn({} @ {})", self.mtr, self.trh_key)
    }
}

/// Transaction state at the TRH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Active; heartbeats extend the expiry deadline.
    InProgress,
    /// Aborted by the system (lost PUSH or missed heartbeats). The client has
    /// not yet learned of the abort; its End converts this to `Aborted`.
    ForceAborted,
    Committed,
    Aborted,
    /// Record erased after all write keys finalized. Terminal.
    Deleted,
}

impl TxnState {
    /// True for states that an End request can no longer change.
    #[inline]
    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Aborted | TxnState::Deleted
        )
    }
}

/// The action requested by an End or Finalize verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndAction {
    Commit,
    Abort,
}

/// The authoritative per-transaction record held at the TRH.
#[derive(Debug, Clone)]
pub struct TxnRecord {
    pub txn_id: TxnId,
    pub state: TxnState,
    /// Every (collection, key) this transaction has written anywhere in the
    /// cluster. Populated by the End request.
    pub write_keys: BTreeSet<(String, Key)>,
    pub last_heartbeat: Instant,
    pub expiry_deadline: Instant,
    /// True once a write-intent for this transaction exists somewhere; such a
    /// record must survive until its writes are finalized.
    pub has_intent: bool,
    /// The decided finalize action, set when the record leaves `InProgress`
    /// via an End request.
    pub finalize_action: Option<EndAction>,
}

impl TxnRecord {
    pub fn new(txn_id: TxnId, now: Instant, expiry: std::time::Duration) -> Self {
        Self {
            txn_id,
            state: TxnState::InProgress,
            write_keys: BTreeSet::new(),
            last_heartbeat: now,
            expiry_deadline: now + expiry,
            has_intent: false,
            finalize_action: None,
        }
    }
}
