// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction-record manager: the TRH role of a partition.
//!
//! Holds the authoritative record for every transaction whose routing key
//! lies in this partition. The manager is pure in-memory state; the partition
//! module sequences every state change as persist-then-apply, so the
//! persistence log stays authoritative for races (a Commit that persists
//! before a concurrent ForceAbort wins).

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::schema::Key;
use super::error::TxnError;
use super::push::{arbitrate, PushDecision, PushWinner};
use super::record::{EndAction, Mtr, TxnId, TxnRecord, TxnState};

/// Planned outcome of an End request, computed before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndPlan {
    /// State the record moves to.
    pub new_state: TxnState,
    /// A Commit request landed on a force-aborted (or already-aborted)
    /// record; the caller must surface the abort to the client.
    pub downgraded: bool,
    /// Duplicate End: nothing to persist or apply.
    pub already_ended: bool,
}

/// Planned outcome of a PUSH, computed before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushPlan {
    pub decision: PushDecision,
    /// The incumbent record must be persisted `ForceAborted` before the
    /// decision leaves this partition.
    pub persist_force_abort: bool,
    /// No record existed for the incumbent; a `ForceAborted` fence record is
    /// created so a late first write from that transaction is rejected.
    pub create_fence: bool,
}

/// Per-partition transaction-record table.
pub struct TxnManager {
    records: HashMap<TxnId, TxnRecord>,
    txn_expiry: Duration,
}

impl TxnManager {
    pub fn new(txn_expiry: Duration) -> Self {
        Self {
            records: HashMap::new(),
            txn_expiry,
        }
    }

    pub fn get(&self, txn_id: &TxnId) -> Option<&TxnRecord> {
        self.records.get(txn_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Creates the record for a transaction's first write at its TRH.
    pub fn create_in_progress(&mut self, txn_id: TxnId, now: Instant) -> Result<(), TxnError> {
        if let Some(existing) = self.records.get(&txn_id) {
            return Err(TxnError::AlreadyExists {
                state: existing.state,
            });
        }
        debug!(txn = %txn_id, "creating transaction record");
        self.records
            .insert(txn_id.clone(), TxnRecord::new(txn_id, now, self.txn_expiry));
        Ok(())
    }

    /// Marks that a write-intent exists for this transaction.
    pub fn mark_intent(&mut self, txn_id: &TxnId) {
        if let Some(rec) = self.records.get_mut(txn_id) {
            rec.has_intent = true;
        }
    }

    /// Extends the expiry deadline of an in-progress transaction.
    ///
    /// For any other state the current state is returned unchanged so the
    /// client can learn what happened to its transaction. Idempotent.
    pub fn heartbeat(&mut self, txn_id: &TxnId, now: Instant) -> Result<TxnState, TxnError> {
        let rec = self.records.get_mut(txn_id).ok_or(TxnError::NotFound)?;
        if rec.state == TxnState::InProgress {
            rec.last_heartbeat = now;
            rec.expiry_deadline = now + self.txn_expiry;
        }
        Ok(rec.state)
    }

    /// Computes the transition an End request causes, without applying it.
    pub fn plan_end(&self, txn_id: &TxnId, action: EndAction) -> Result<EndPlan, TxnError> {
        let rec = self.records.get(txn_id).ok_or(TxnError::NotFound)?;
        match (rec.state, action) {
            (TxnState::InProgress, EndAction::Commit) => Ok(EndPlan {
                new_state: TxnState::Committed,
                downgraded: false,
                already_ended: false,
            }),
            (TxnState::InProgress, EndAction::Abort) => Ok(EndPlan {
                new_state: TxnState::Aborted,
                downgraded: false,
                already_ended: false,
            }),
            (TxnState::ForceAborted, _) => Ok(EndPlan {
                new_state: TxnState::Aborted,
                downgraded: action == EndAction::Commit,
                already_ended: false,
            }),
            (TxnState::Committed, EndAction::Commit)
            | (TxnState::Aborted, EndAction::Abort) => Ok(EndPlan {
                new_state: rec.state,
                downgraded: false,
                already_ended: true,
            }),
            // A retried Commit after the downgrade path keeps reporting the
            // abort without touching state.
            (TxnState::Aborted, EndAction::Commit) => Ok(EndPlan {
                new_state: TxnState::Aborted,
                downgraded: true,
                already_ended: true,
            }),
            (state, requested) => Err(TxnError::ConflictingEnd { state, requested }),
        }
    }

    /// Applies a planned End after its transition has been persisted.
    pub fn apply_end(
        &mut self,
        txn_id: &TxnId,
        new_state: TxnState,
        write_keys: BTreeSet<(String, Key)>,
    ) {
        if let Some(rec) = self.records.get_mut(txn_id) {
            info!(txn = %txn_id, from = ?rec.state, to = ?new_state, "transaction ended");
            rec.state = new_state;
            rec.write_keys.extend(write_keys);
            rec.finalize_action = Some(match new_state {
                TxnState::Committed => EndAction::Commit,
                _ => EndAction::Abort,
            });
        }
    }

    /// Computes the outcome of a PUSH against an incumbent transaction.
    pub fn plan_push(&self, incumbent: &TxnId, challenger: &Mtr) -> PushPlan {
        match self.records.get(incumbent) {
            None => PushPlan {
                decision: PushDecision {
                    incumbent_state: TxnState::ForceAborted,
                    allow_challenger: true,
                },
                persist_force_abort: true,
                create_fence: true,
            },
            Some(rec) => match rec.state {
                TxnState::InProgress => match arbitrate(challenger, &incumbent.mtr) {
                    PushWinner::Challenger => PushPlan {
                        decision: PushDecision {
                            incumbent_state: TxnState::ForceAborted,
                            allow_challenger: true,
                        },
                        persist_force_abort: true,
                        create_fence: false,
                    },
                    PushWinner::Incumbent => PushPlan {
                        decision: PushDecision {
                            incumbent_state: TxnState::InProgress,
                            allow_challenger: false,
                        },
                        persist_force_abort: false,
                        create_fence: false,
                    },
                },
                // Terminal and force-aborted states are returned as-is; the
                // caller resolves the intent accordingly and proceeds.
                state => PushPlan {
                    decision: PushDecision {
                        incumbent_state: state,
                        allow_challenger: true,
                    },
                    persist_force_abort: false,
                    create_fence: false,
                },
            },
        }
    }

    /// Applies a planned PUSH after persistence.
    pub fn apply_push(&mut self, incumbent: &TxnId, plan: &PushPlan, now: Instant) {
        if plan.create_fence {
            let mut rec = TxnRecord::new(incumbent.clone(), now, self.txn_expiry);
            rec.state = TxnState::ForceAborted;
            info!(txn = %incumbent, "push against unknown transaction; fencing as force-aborted");
            self.records.insert(incumbent.clone(), rec);
        } else if plan.persist_force_abort {
            if let Some(rec) = self.records.get_mut(incumbent) {
                info!(txn = %incumbent, "transaction lost push; force-aborting");
                rec.state = TxnState::ForceAborted;
            }
        }
    }

    /// Force-aborts an in-progress transaction (heartbeat expiry).
    ///
    /// Caller persists the transition first.
    pub fn force_abort(&mut self, txn_id: &TxnId) {
        if let Some(rec) = self.records.get_mut(txn_id) {
            if rec.state == TxnState::InProgress {
                warn!(txn = %txn_id, "heartbeat expired; force-aborting");
                rec.state = TxnState::ForceAborted;
            }
        }
    }

    /// Returns the in-progress transactions whose expiry deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<TxnId> {
        self.records
            .values()
            .filter(|r| r.state == TxnState::InProgress && r.expiry_deadline <= now)
            .map(|r| r.txn_id.clone())
            .collect()
    }

    /// Erases a committed or aborted record once all its write keys have
    /// been finalized. Returns the erased record.
    pub fn mark_finalized(&mut self, txn_id: &TxnId) -> Option<TxnRecord> {
        match self.records.get(txn_id).map(|r| r.state) {
            Some(TxnState::Committed) | Some(TxnState::Aborted) => {
                info!(txn = %txn_id, "all write keys finalized; erasing record");
                self.records.remove(txn_id)
            }
            _ => None,
        }
    }

    /// Drops force-aborted fence records older than the retention horizon.
    ///
    /// A write from such a transaction can no longer arrive: it would fail
    /// retention validation anyway.
    pub fn retention_sweep(&mut self, retention_ts: &crate::time::Timestamp) -> usize {
        let before = self.records.len();
        self.records.retain(|id, rec| {
            !(rec.state == TxnState::ForceAborted
                && !rec.has_intent
                && id.mtr.timestamp.compare_certain(retention_ts) == std::cmp::Ordering::Less)
        });
        before - self.records.len()
    }

    /// Snapshot of every record, for inspection verbs and checkpoints.
    pub fn inspect_all(&self) -> Vec<TxnRecord> {
        self.records.values().cloned().collect()
    }

    /// Rebuilds a record during recovery, with fresh wall-clock deadlines.
    ///
    /// Monotone on the state lattice: an existing record is only moved
    /// forward, never back to a less-decided state.
    pub fn restore(
        &mut self,
        txn_id: TxnId,
        state: TxnState,
        write_keys: Vec<(String, Key)>,
        has_intent: bool,
        now: Instant,
    ) {
        let expiry = self.txn_expiry;
        let rec = self
            .records
            .entry(txn_id.clone())
            .or_insert_with(|| TxnRecord::new(txn_id, now, expiry));
        let advance = match (rec.state, state) {
            (a, b) if a == b => true,
            (TxnState::InProgress, _) => true,
            (TxnState::ForceAborted, TxnState::Aborted) => true,
            _ => false,
        };
        if advance {
            rec.state = state;
            rec.write_keys.extend(write_keys);
            rec.has_intent |= has_intent;
            if state.is_decided() {
                rec.finalize_action = Some(match state {
                    TxnState::Committed => EndAction::Commit,
                    _ => EndAction::Abort,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;
    use crate::txn::record::Priority;

    fn txn_id(ts: u64) -> TxnId {
        TxnId {
            collection: "c".to_string(),
            trh_key: Key::new("s", "trh", ""),
            mtr: Mtr::new(Timestamp::from_nanos(ts), Priority::MEDIUM, ts),
        }
    }

    fn manager() -> TxnManager {
        TxnManager::new(Duration::from_millis(100))
    }

    #[test]
    fn test_create_and_heartbeat() {
        let mut mgr = manager();
        let id = txn_id(100);
        let now = Instant::now();
        mgr.create_in_progress(id.clone(), now).unwrap();

        let state = mgr.heartbeat(&id, now + Duration::from_millis(50)).unwrap();
        assert_eq!(state, TxnState::InProgress);

        // extended deadline outlives the original one
        let rec = mgr.get(&id).unwrap();
        assert!(rec.expiry_deadline > now + Duration::from_millis(100));
    }

    #[test]
    fn test_heartbeat_unknown_txn() {
        let mut mgr = manager();
        assert!(matches!(
            mgr.heartbeat(&txn_id(1), Instant::now()),
            Err(TxnError::NotFound)
        ));
    }

    #[test]
    fn test_heartbeat_reports_terminal_state() {
        let mut mgr = manager();
        let id = txn_id(100);
        let now = Instant::now();
        mgr.create_in_progress(id.clone(), now).unwrap();
        mgr.force_abort(&id);

        let state = mgr.heartbeat(&id, now).unwrap();
        assert_eq!(state, TxnState::ForceAborted);
    }

    #[test]
    fn test_end_commit() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();

        let plan = mgr.plan_end(&id, EndAction::Commit).unwrap();
        assert_eq!(plan.new_state, TxnState::Committed);
        assert!(!plan.downgraded);
        assert!(!plan.already_ended);

        mgr.apply_end(&id, plan.new_state, BTreeSet::new());
        assert_eq!(mgr.get(&id).unwrap().state, TxnState::Committed);
        assert_eq!(mgr.get(&id).unwrap().finalize_action, Some(EndAction::Commit));
    }

    #[test]
    fn test_end_commit_after_force_abort_downgrades() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();
        mgr.force_abort(&id);

        let plan = mgr.plan_end(&id, EndAction::Commit).unwrap();
        assert_eq!(plan.new_state, TxnState::Aborted);
        assert!(plan.downgraded);

        mgr.apply_end(&id, plan.new_state, BTreeSet::new());
        assert_eq!(mgr.get(&id).unwrap().finalize_action, Some(EndAction::Abort));
    }

    #[test]
    fn test_duplicate_end_same_action_is_noop() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();
        let plan = mgr.plan_end(&id, EndAction::Commit).unwrap();
        mgr.apply_end(&id, plan.new_state, BTreeSet::new());

        let replay = mgr.plan_end(&id, EndAction::Commit).unwrap();
        assert!(replay.already_ended);
        assert!(!replay.downgraded);
    }

    #[test]
    fn test_abort_after_commit_rejected() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();
        let plan = mgr.plan_end(&id, EndAction::Commit).unwrap();
        mgr.apply_end(&id, plan.new_state, BTreeSet::new());

        assert!(matches!(
            mgr.plan_end(&id, EndAction::Abort),
            Err(TxnError::ConflictingEnd { .. })
        ));
    }

    #[test]
    fn test_retried_commit_after_downgrade_still_reports_abort() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();
        mgr.force_abort(&id);
        let plan = mgr.plan_end(&id, EndAction::Commit).unwrap();
        mgr.apply_end(&id, plan.new_state, BTreeSet::new());

        let retry = mgr.plan_end(&id, EndAction::Commit).unwrap();
        assert!(retry.already_ended);
        assert!(retry.downgraded);
    }

    #[test]
    fn test_push_unknown_incumbent_creates_fence() {
        let mut mgr = manager();
        let id = txn_id(100);
        let challenger = Mtr::new(Timestamp::from_nanos(200), Priority::MEDIUM, 7);

        let plan = mgr.plan_push(&id, &challenger);
        assert!(plan.create_fence);
        assert!(plan.decision.allow_challenger);
        mgr.apply_push(&id, &plan, Instant::now());

        assert_eq!(mgr.get(&id).unwrap().state, TxnState::ForceAborted);

        // late first write from the fenced transaction is rejected
        assert!(matches!(
            mgr.create_in_progress(id, Instant::now()),
            Err(TxnError::AlreadyExists {
                state: TxnState::ForceAborted
            })
        ));
    }

    #[test]
    fn test_push_older_challenger_wins() {
        let mut mgr = manager();
        let incumbent = txn_id(100);
        mgr.create_in_progress(incumbent.clone(), Instant::now())
            .unwrap();

        let challenger = Mtr::new(Timestamp::from_nanos(80), Priority::MEDIUM, 7);
        let plan = mgr.plan_push(&incumbent, &challenger);
        assert!(plan.decision.allow_challenger);
        assert!(plan.persist_force_abort);
        mgr.apply_push(&incumbent, &plan, Instant::now());
        assert_eq!(mgr.get(&incumbent).unwrap().state, TxnState::ForceAborted);
    }

    #[test]
    fn test_push_younger_challenger_loses() {
        let mut mgr = manager();
        let incumbent = txn_id(100);
        mgr.create_in_progress(incumbent.clone(), Instant::now())
            .unwrap();

        let challenger = Mtr::new(Timestamp::from_nanos(200), Priority::MEDIUM, 7);
        let plan = mgr.plan_push(&incumbent, &challenger);
        assert!(!plan.decision.allow_challenger);
        assert_eq!(plan.decision.incumbent_state, TxnState::InProgress);
        mgr.apply_push(&incumbent, &plan, Instant::now());
        assert_eq!(mgr.get(&incumbent).unwrap().state, TxnState::InProgress);
    }

    #[test]
    fn test_push_committed_incumbent_returned_as_is() {
        let mut mgr = manager();
        let incumbent = txn_id(100);
        mgr.create_in_progress(incumbent.clone(), Instant::now())
            .unwrap();
        let plan = mgr.plan_end(&incumbent, EndAction::Commit).unwrap();
        mgr.apply_end(&incumbent, plan.new_state, BTreeSet::new());

        let challenger = Mtr::new(Timestamp::from_nanos(80), Priority::HIGH, 7);
        let push = mgr.plan_push(&incumbent, &challenger);
        assert_eq!(push.decision.incumbent_state, TxnState::Committed);
        assert!(push.decision.allow_challenger);
        assert!(!push.persist_force_abort);
    }

    #[test]
    fn test_expiry_detection() {
        let mut mgr = manager();
        let id = txn_id(100);
        let now = Instant::now();
        mgr.create_in_progress(id.clone(), now).unwrap();

        assert!(mgr.expired(now).is_empty());
        let later = now + Duration::from_millis(200);
        assert_eq!(mgr.expired(later), vec![id]);
    }

    #[test]
    fn test_mark_finalized_erases_record() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();
        let plan = mgr.plan_end(&id, EndAction::Commit).unwrap();
        mgr.apply_end(&id, plan.new_state, BTreeSet::new());

        assert!(mgr.mark_finalized(&id).is_some());
        assert!(mgr.get(&id).is_none());
        // idempotent
        assert!(mgr.mark_finalized(&id).is_none());
    }

    #[test]
    fn test_mark_finalized_skips_in_progress() {
        let mut mgr = manager();
        let id = txn_id(100);
        mgr.create_in_progress(id.clone(), Instant::now()).unwrap();
        assert!(mgr.mark_finalized(&id).is_none());
        assert!(mgr.get(&id).is_some());
    }

    #[test]
    fn test_retention_sweep_drops_old_fences() {
        let mut mgr = manager();
        let old = txn_id(100);
        let fresh = txn_id(10_000);
        let challenger = Mtr::new(Timestamp::from_nanos(200), Priority::MEDIUM, 7);

        for id in [&old, &fresh] {
            let plan = mgr.plan_push(id, &challenger);
            mgr.apply_push(id, &plan, Instant::now());
        }

        let swept = mgr.retention_sweep(&Timestamp::from_nanos(5_000));
        assert_eq!(swept, 1);
        assert!(mgr.get(&old).is_none());
        assert!(mgr.get(&fresh).is_some());
    }
}
