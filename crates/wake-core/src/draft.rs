// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Copy-on-write draft context and the immutable applier.
//!
//! A [`Draft`] wraps a working root alongside the base it was forked from.
//! Transactions apply atomically: a snapshot of the working root is taken
//! before each transaction, and any op failure or validation rejection
//! resets the root to that snapshot.
//!
//! Ownership tracking falls out of the refcounts. Forking the draft (and
//! each per-transaction snapshot) holds a reference to every reachable
//! node, so the first mutation of any shared node shallow-clones it exactly
//! once; nodes cloned earlier in the same transaction have a refcount of
//! one along the draft's spine and are then mutated in place. Untouched
//! siblings keep their identity with the base, which is what makes derived
//! states cheap to compare and share.
//!
//! Inserted values are not deep-cloned. The engine never mutates a value it
//! handed out or was handed, so sharing inserted subtrees with the caller
//! is safe; callers that keep mutating their copy must pass
//! [`Value::deep_clone`]s.

use crate::apply::{exec_op, ApplyError};
use crate::op::Op;
use crate::value::Value;

/// Pure predicate over a candidate state.
pub type Validator = dyn Fn(&Value) -> bool;

/// Copy-on-write working context for the immutable applier.
#[derive(Debug)]
pub struct Draft {
    base: Value,
    root: Value,
}

impl Draft {
    /// Forks a draft from `base`. The working root starts shared with it.
    #[must_use]
    pub fn new(base: Value) -> Self {
        let root = base.clone();
        Self { base, root }
    }

    /// The base this draft was forked from.
    #[must_use]
    pub fn base(&self) -> &Value {
        &self.base
    }

    /// The current working root.
    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Returns `true` when any transaction has produced a new root.
    #[must_use]
    pub fn changed(&self) -> bool {
        !Value::ptr_eq(&self.base, &self.root)
    }

    /// Applies one transaction atomically.
    ///
    /// On success the working root holds the post-transaction state. On
    /// rejection the root is reset to its pre-transaction value and the
    /// draft remains usable for subsequent transactions.
    ///
    /// # Errors
    ///
    /// The rejected op's reason, or [`ApplyError::ValidationRejected`].
    pub fn apply_tx(&mut self, ops: &[Op], validate: Option<&Validator>) -> Result<(), ApplyError> {
        let snapshot = self.root.clone();
        for op in ops {
            if let Err(err) = exec_op(&mut self.root, op, None) {
                self.root = snapshot;
                return Err(err);
            }
        }
        if let Some(validate) = validate {
            if !validate(&self.root) {
                self.root = snapshot;
                return Err(ApplyError::ValidationRejected);
            }
        }
        Ok(())
    }

    /// Consumes the draft, returning the final root.
    #[must_use]
    pub fn into_root(self) -> Value {
        self.root
    }
}

/// Outcome of applying a batch of transactions immutably.
#[derive(Debug)]
pub struct TxBatchOutcome {
    /// Final root. Shares identity with the base when nothing applied.
    pub root: Value,
    /// Per-transaction success flags, in input order.
    pub applied: Vec<bool>,
}

/// Applies a sequence of transactions over one shared draft.
///
/// Each transaction is atomic; a rejected transaction is skipped and the
/// engine proceeds with the next one. When no transaction succeeds the
/// returned root is reference-equal to `base`.
#[must_use]
pub fn apply_txs_immutable(
    base: &Value,
    txs: &[&[Op]],
    validate: Option<&Validator>,
) -> TxBatchOutcome {
    let mut draft = Draft::new(base.clone());
    let applied = txs
        .iter()
        .map(|ops| draft.apply_tx(ops, validate).is_ok())
        .collect();
    TxBatchOutcome {
        root: draft.into_root(),
        applied,
    }
}
