// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction-record management and PUSH conflict resolution.
//!
//! Every transaction designates a routing key; the partition owning that key
//! is the transaction's *record holder* (TRH) and runs the authoritative
//! state machine for it:
//!
//! ```text
//! InProgress --end(Commit)--> Committed --all finalized--> Deleted
//! InProgress --end(Abort)---> Aborted   --all finalized--> Deleted
//! InProgress --expiry/lost push--> ForceAborted --end(*)--> Aborted
//! ```
//!
//! Conflicts between transactions are resolved by the PUSH protocol
//! ([`push::arbitrate`]): deterministic, priority-then-seniority, so at most
//! one of two conflicting transactions ever commits and at least one member
//! of any conflict cycle survives.

mod error;
mod manager;
mod push;
mod record;

pub use error::TxnError;
pub use manager::{EndPlan, PushPlan, TxnManager};
pub use push::{arbitrate, PushDecision, PushWinner};
pub use record::{EndAction, Mtr, Priority, TxnId, TxnRecord, TxnState};
