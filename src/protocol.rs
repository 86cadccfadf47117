// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Request and response shapes for the partition verbs, the client-visible
//! status taxonomy, and the traits behind which remote collaborators live.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::partition::indexer::Version;
use crate::schema::{FieldValue, Key, Record, Schema};
use crate::txn::{EndAction, Mtr, TxnId, TxnRecord, TxnState};

/// Client-distinguishable error statuses. Success is the `Ok` arm of the
/// surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("key not found")]
    KeyNotFound,

    #[error("partition map refresh needed: {0}")]
    RefreshCollection(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("request too old: {0}")]
    AbortRequestTooOld(String),

    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("aborted due to conflict: {0}")]
    AbortConflict(String),

    #[error("request deadline exceeded")]
    RequestTimeout,

    #[error("partition moved: {0}")]
    Gone(String),

    #[error("service unavailable, retry: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-request deadline. Checked on entry and after every suspension point.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Self {
            at: Instant::now() + d,
        }
    }

    #[inline]
    pub fn is_past(&self) -> bool {
        Instant::now() >= self.at
    }

    #[inline]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Identity and ownership of one partition of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub collection: String,
    /// Partition version id; bumped when the partition map changes.
    pub pvid: u64,
    /// Inclusive start of the owned partition-key range.
    pub start_partition_key: String,
    /// Exclusive end of the owned partition-key range; empty means unbounded.
    pub end_partition_key: String,
}

impl PartitionMeta {
    /// Returns true if this partition owns the key's partition key.
    pub fn owns(&self, key: &Key) -> bool {
        key.partition_key >= self.start_partition_key
            && (self.end_partition_key.is_empty()
                || key.partition_key < self.end_partition_key)
    }
}

/// Per-row filter predicate: a small expression tree over schema fields.
///
/// A comparison against an unset field evaluates to false; a comparison
/// whose value type does not match the schema field's type is a
/// `BadParameter` error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterExpr {
    Eq { field: String, value: FieldValue },
    Lt { field: String, value: FieldValue },
    Lte { field: String, value: FieldValue },
    Gt { field: String, value: FieldValue },
    Gte { field: String, value: FieldValue },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

// ---- verb requests / responses ----

#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub collection: String,
    pub pvid: u64,
    pub key: Key,
    pub mtr: Mtr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub record: Record,
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub collection: String,
    pub pvid: u64,
    pub key: Key,
    pub mtr: Mtr,
    /// Routing key of the transaction's record holder.
    pub trh_key: Key,
    /// Tombstone write.
    pub is_delete: bool,
    /// Full record image, or the changed fields when `field_mask` is set.
    pub value: Record,
    /// Indices (into the request schema's fields) of the fields to update;
    /// the remaining fields are taken from the previous version.
    pub field_mask: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub collection: String,
    pub pvid: u64,
    pub mtr: Mtr,
    pub schema_name: String,
    /// Where iteration begins, inclusive: the low end of the range for a
    /// forward scan, the high end for a reverse scan. An empty partition key
    /// means the corresponding boundary of the schema's key set.
    pub start_key: Key,
    /// Where iteration stops, exclusive. An empty partition key means the
    /// corresponding boundary of the schema's key set.
    pub end_key: Key,
    /// Skip `start_key` itself (continuations use this).
    pub exclusive_start: bool,
    pub reverse: bool,
    pub filter: Option<FilterExpr>,
    /// Field names to keep; `None` keeps the full record.
    pub projection: Option<Vec<String>>,
    /// Per-request row cap; the partition's page limits still apply.
    pub record_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub records: Vec<Record>,
    /// Next key to visit; resubmit it as `start_key` (with
    /// `exclusive_start` unset) to continue. `None` means the scan is
    /// complete.
    pub continuation: Option<Key>,
}

#[derive(Debug, Clone)]
pub struct TxnPushRequest {
    pub collection: String,
    pub incumbent: TxnId,
    pub challenger: Mtr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnPushResponse {
    pub incumbent_state: TxnState,
    pub allow_challenger: bool,
}

#[derive(Debug, Clone)]
pub struct TxnEndRequest {
    pub txn_id: TxnId,
    pub action: EndAction,
    /// Every (collection, key) the transaction wrote, cluster-wide.
    pub write_keys: Vec<(String, Key)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnEndResponse {
    pub state: TxnState,
}

#[derive(Debug, Clone)]
pub struct TxnHeartbeatRequest {
    pub txn_id: TxnId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnHeartbeatResponse {
    pub state: TxnState,
}

#[derive(Debug, Clone)]
pub struct TxnFinalizeRequest {
    pub txn_id: TxnId,
    pub key: Key,
    pub action: EndAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnFinalizeResponse {}

#[derive(Debug, Clone)]
pub struct PushSchemaRequest {
    pub schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSchemaResponse {}

// ---- inspection verbs (test and debug; read-only) ----

#[derive(Debug, Clone)]
pub struct InspectRecordsResponse {
    pub key: Key,
    pub versions: Vec<Version>,
}

#[derive(Debug, Clone)]
pub struct InspectTxnResponse {
    pub record: TxnRecord,
}

#[derive(Debug, Clone)]
pub struct InspectWriteIntentsResponse {
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone)]
pub struct InspectAllTxnsResponse {
    pub records: Vec<TxnRecord>,
}

#[derive(Debug, Clone)]
pub struct InspectAllKeysResponse {
    pub keys: Vec<Key>,
}

// ---- remote collaborator seams ----

/// Control-plane facade: which partition owns a key.
#[async_trait]
pub trait PartitionLocator: Send + Sync {
    async fn locate(&self, collection: &str, key: &Key) -> Result<PartitionMeta, Status>;
}

/// Cross-partition transaction RPCs (PUSH and finalize).
#[async_trait]
pub trait TxnTransport: Send + Sync {
    async fn push(
        &self,
        target: &PartitionMeta,
        req: TxnPushRequest,
    ) -> Result<TxnPushResponse, Status>;

    async fn finalize(
        &self,
        target: &PartitionMeta,
        req: TxnFinalizeRequest,
    ) -> Result<TxnFinalizeResponse, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_owns() {
        let meta = PartitionMeta {
            collection: "c".to_string(),
            pvid: 1,
            start_partition_key: "b".to_string(),
            end_partition_key: "m".to_string(),
        };
        assert!(meta.owns(&Key::new("s", "b", "")));
        assert!(meta.owns(&Key::new("s", "laaa", "")));
        assert!(!meta.owns(&Key::new("s", "m", "")));
        assert!(!meta.owns(&Key::new("s", "a", "")));
    }

    #[test]
    fn test_unbounded_end_owns_tail() {
        let meta = PartitionMeta {
            collection: "c".to_string(),
            pvid: 1,
            start_partition_key: String::new(),
            end_partition_key: String::new(),
        };
        assert!(meta.owns(&Key::new("s", "anything", "")));
    }

    #[test]
    fn test_deadline() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.is_past());
        assert!(d.remaining() > Duration::from_secs(30));

        let past = Deadline::after(Duration::ZERO);
        assert!(past.is_past());
        assert_eq!(past.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_statuses_are_distinguishable() {
        assert_ne!(
            Status::AbortConflict("x".to_string()),
            Status::AbortRequestTooOld("x".to_string())
        );
        assert_eq!(Status::KeyNotFound, Status::KeyNotFound);
    }
}
