// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! PUSH conflict arbitration.
//!
//! When an operation encounters a write-intent held by another transaction,
//! the encountering transaction (the *challenger*) pushes the intent's owner
//! (the *incumbent*) at the incumbent's TRH. If the incumbent is still in
//! progress, exactly one of the two survives, decided by the priority tuple:
//!
//! 1. higher priority wins;
//! 2. at equal priority, the older timestamp wins (seniority — this is what
//!    makes every conflict cycle lose at least one member, so the protocol
//!    never livelocks);
//! 3. at equal timestamp, the lower MTR hash wins.

use std::cmp::Ordering;

use super::record::{Mtr, TxnState};

/// Which side of a PUSH survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushWinner {
    Challenger,
    Incumbent,
}

/// Decision returned by the TRH to the pushing partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushDecision {
    /// The incumbent's state after arbitration.
    pub incumbent_state: TxnState,
    /// Whether the challenger may proceed with its operation.
    pub allow_challenger: bool,
}

/// Arbitrates between two in-progress transactions.
///
/// Deterministic: both sides of any conflict compute the same winner.
pub fn arbitrate(challenger: &Mtr, incumbent: &Mtr) -> PushWinner {
    match challenger.priority.cmp(&incumbent.priority) {
        Ordering::Greater => return PushWinner::Challenger,
        Ordering::Less => return PushWinner::Incumbent,
        Ordering::Equal => {}
    }
    match challenger.timestamp.compare_certain(&incumbent.timestamp) {
        Ordering::Less => return PushWinner::Challenger,
        Ordering::Greater => return PushWinner::Incumbent,
        Ordering::Equal => {}
    }
    if challenger.id_hash <= incumbent.id_hash {
        PushWinner::Challenger
    } else {
        PushWinner::Incumbent
    }
}
