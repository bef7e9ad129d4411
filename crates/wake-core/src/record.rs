// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Stored record types for the two shared maps.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::op::Op;
use crate::value::Value;

/// One transaction as stored in the shared log map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    /// The transaction's ops, immutable once stored.
    pub ops: Rc<[Op]>,
    /// When present, this record is a re-emission of the transaction
    /// originally published under this key. The original key is the
    /// record's logical identity for deduplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_key: Option<String>,
}

impl TxRecord {
    /// Builds a fresh (non-re-emitted) record.
    #[must_use]
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops: Rc::from(ops),
            original_key: None,
        }
    }

    /// Builds a re-emission of `original_key` carrying the same ops.
    #[must_use]
    pub fn re_emission(ops: Rc<[Op]>, original_key: String) -> Self {
        Self {
            ops,
            original_key: Some(original_key),
        }
    }
}

/// Per-client absorption mark stored in a checkpoint.
///
/// A transaction from `client_id` is covered by the checkpoint iff
/// `max_clock >= ts.clock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Highest absorbed Lamport clock for the client.
    pub max_clock: u64,
    /// Wall clock of that highest absorbed transaction, used for retention.
    pub max_wall_clock: i64,
}

/// One checkpoint as stored in the shared checkpoint map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Derived document state at the epoch boundary. Always an object.
    pub state: Value,
    /// Per-client watermarks. `BTreeMap` keeps peer iteration deterministic.
    pub watermarks: BTreeMap<String, Watermark>,
    /// Number of transactions absorbed from the finalized epoch.
    pub tx_count: u64,
    /// Smallest wall clock among the absorbed transactions; the reference
    /// time for retention pruning.
    pub min_wall_clock: i64,
}

impl CheckpointRecord {
    /// Returns `true` when `watermarks` cover a transaction with the given
    /// client and clock.
    #[must_use]
    pub fn covers(&self, client_id: &str, clock: u64) -> bool {
        self.watermarks
            .get(client_id)
            .is_some_and(|w| w.max_clock >= clock)
    }
}
