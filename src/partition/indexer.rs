// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The versioned indexer: ordered map from key to version history.
//!
//! Each key maps to a deque of versions sorted strictly descending by
//! certain timestamp order (newest at the front). At most one write-intent
//! exists per key and, if present, it is the head; its timestamp is
//! certain-greater than every committed version below it (the write path's
//! stale-write check maintains this).

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::schema::{Key, Record};
use crate::time::Timestamp;
use crate::txn::TxnId;

/// The body of a version entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionBody {
    /// A committed version; `None` is a tombstone.
    Committed { value: Option<Record> },
    /// An uncommitted write pending finalize; `None` is a pending delete.
    Intent {
        owner: TxnId,
        value: Option<Record>,
    },
}

/// One entry in a key's version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: Timestamp,
    pub body: VersionBody,
}

impl Version {
    #[inline]
    pub fn is_intent(&self) -> bool {
        matches!(self.body, VersionBody::Intent { .. })
    }

    /// Returns the committed value, if this is a committed version.
    pub fn committed_value(&self) -> Option<&Option<Record>> {
        match &self.body {
            VersionBody::Committed { value } => Some(value),
            VersionBody::Intent { .. } => None,
        }
    }
}

/// Errors from indexer mutations.
///
/// `DuplicateTimestamp` is an assertion fault: it indicates a broken
/// invariant and the partition halts on it rather than continuing.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("duplicate committed timestamp {timestamp} for key {key}")]
    DuplicateTimestamp { key: Key, timestamp: Timestamp },

    #[error("write intent already present for key {key}, owned by {owner}")]
    IntentConflict { key: Key, owner: TxnId },
}

/// Ordered mapping key -> descending version history.
#[derive(Debug, Default)]
pub struct Indexer {
    map: BTreeMap<Key, VecDeque<Version>>,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with at least one version.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the newest committed version with `timestamp <= ts` (certain).
    ///
    /// A write-intent head is never returned here; callers discover it via
    /// [`Indexer::intent`] and treat it as a conflict signal, not a value.
    pub fn get_version_not_newer_than(&self, key: &Key, ts: &Timestamp) -> Option<&Version> {
        self.map.get(key)?.iter().find(|v| {
            !v.is_intent() && v.timestamp.compare_certain(ts) != std::cmp::Ordering::Greater
        })
    }

    /// Returns the key's write-intent head, if any.
    pub fn intent(&self, key: &Key) -> Option<&Version> {
        self.map.get(key)?.front().filter(|v| v.is_intent())
    }

    /// Inserts a committed version at its sorted position.
    pub fn insert_committed(
        &mut self,
        key: Key,
        timestamp: Timestamp,
        value: Option<Record>,
    ) -> Result<(), IndexerError> {
        let versions = self.map.entry(key.clone()).or_default();
        let mut idx = versions.len();
        for (i, v) in versions.iter().enumerate() {
            if v.is_intent() {
                continue;
            }
            match timestamp.compare_certain(&v.timestamp) {
                std::cmp::Ordering::Greater => {
                    idx = i;
                    break;
                }
                std::cmp::Ordering::Equal => {
                    return Err(IndexerError::DuplicateTimestamp { key, timestamp });
                }
                std::cmp::Ordering::Less => {}
            }
        }
        versions.insert(
            idx,
            Version {
                timestamp,
                body: VersionBody::Committed { value },
            },
        );
        Ok(())
    }

    /// Installs a write-intent as the key's head version.
    pub fn install_intent(
        &mut self,
        key: Key,
        timestamp: Timestamp,
        owner: TxnId,
        value: Option<Record>,
    ) -> Result<(), IndexerError> {
        if let Some(existing) = self.intent(&key) {
            if let VersionBody::Intent { owner: holder, .. } = &existing.body {
                return Err(IndexerError::IntentConflict {
                    key,
                    owner: holder.clone(),
                });
            }
        }
        self.map.entry(key).or_default().push_front(Version {
            timestamp,
            body: VersionBody::Intent { owner, value },
        });
        Ok(())
    }

    /// Converts the key's intent into a committed version at `final_ts`.
    ///
    /// Idempotent: if no intent owned by `owner` is present the indexer is
    /// left unchanged and `Ok(false)` is returned (a replayed finalize after
    /// the intent was already resolved).
    pub fn commit_intent(
        &mut self,
        key: &Key,
        owner: &TxnId,
        final_ts: Timestamp,
    ) -> Result<bool, IndexerError> {
        let value = match self.take_intent(key, owner) {
            Some(value) => value,
            None => return Ok(false),
        };
        match self.insert_committed(key.clone(), final_ts, value) {
            Ok(()) => Ok(true),
            Err(IndexerError::DuplicateTimestamp { .. }) => {
                // the committed version from a previous finalize is already
                // in place
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Removes the key's intent if owned by `owner`. Idempotent.
    pub fn abort_intent(&mut self, key: &Key, owner: &TxnId) -> bool {
        let removed = self.take_intent(key, owner).is_some();
        if removed {
            if let Some(versions) = self.map.get(key) {
                if versions.is_empty() {
                    self.map.remove(key);
                }
            }
        }
        removed
    }

    fn take_intent(&mut self, key: &Key, owner: &TxnId) -> Option<Option<Record>> {
        let versions = self.map.get_mut(key)?;
        let head_matches = matches!(
            versions.front(),
            Some(Version {
                body: VersionBody::Intent { owner: holder, .. },
                ..
            }) if holder == owner
        );
        if !head_matches {
            return None;
        }
        match versions.pop_front() {
            Some(Version {
                body: VersionBody::Intent { value, .. },
                ..
            }) => Some(value),
            _ => None,
        }
    }

    /// All versions of a key, newest first.
    pub fn versions(&self, key: &Key) -> Option<&VecDeque<Version>> {
        self.map.get(key)
    }

    /// Keys in `[start, end)`, in order; reversible for descending scans.
    pub fn keys_in<'a>(
        &'a self,
        start: &'a Key,
        end: &'a Key,
    ) -> impl DoubleEndedIterator<Item = &'a Key> {
        self.keys_between(Bound::Included(start), Bound::Excluded(end))
    }

    /// Keys within explicit bounds, in order; reversible for descending
    /// scans.
    pub fn keys_between<'a>(
        &'a self,
        lo: Bound<&'a Key>,
        hi: Bound<&'a Key>,
    ) -> impl DoubleEndedIterator<Item = &'a Key> {
        self.map.range::<Key, _>((lo, hi)).map(|(k, _)| k)
    }

    /// Rebuilds an indexer from a checkpoint snapshot.
    pub fn restore(snapshot: Vec<(Key, Vec<Version>)>) -> Indexer {
        Indexer {
            map: snapshot
                .into_iter()
                .map(|(k, v)| (k, v.into_iter().collect()))
                .collect(),
        }
    }

    /// All keys currently indexed, in order.
    pub fn all_keys(&self) -> Vec<Key> {
        self.map.keys().cloned().collect()
    }

    /// Keys whose head is a write-intent.
    pub fn keys_with_intents(&self) -> Vec<Key> {
        self.map
            .iter()
            .filter(|(_, v)| v.front().map(|h| h.is_intent()).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Drops committed versions older than the retention horizon.
    ///
    /// The newest committed version of each key is always kept, so keys
    /// written once and never updated stay readable.
    pub fn trim_older_than(&mut self, retention_ts: &Timestamp) -> usize {
        let mut dropped = 0;
        for versions in self.map.values_mut() {
            let mut seen_committed = 0usize;
            let before = versions.len();
            versions.retain(|v| {
                if v.is_intent() {
                    return true;
                }
                seen_committed += 1;
                seen_committed == 1
                    || v.timestamp.compare_certain(retention_ts) != std::cmp::Ordering::Less
            });
            dropped += before - versions.len();
        }
        self.map.retain(|_, v| !v.is_empty());
        dropped
    }

    /// Full snapshot of the indexer, for inspection and checkpoints.
    pub fn snapshot(&self) -> Vec<(Key, Vec<Version>)> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }
}
