// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction manager error types.

use super::record::{EndAction, TxnState};

/// Errors from transaction-record operations at the TRH.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    #[error("transaction record not found")]
    NotFound,

    #[error("transaction already exists in state {state:?}")]
    AlreadyExists { state: TxnState },

    #[error("transaction in state {state:?} cannot accept end action {requested:?}")]
    ConflictingEnd {
        state: TxnState,
        requested: EndAction,
    },
}
