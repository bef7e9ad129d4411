// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Incremental state derivation from the base checkpoint plus sorted log.
//!
//! The calculator owns the sorted log cache and an applied-prefix cursor.
//! While entries only append, each [`StateCalculator::calculate`] call
//! applies just the new suffix over the cached state. Any change that
//! touches the already-applied region (insert before the cursor, removal
//! below it, a different base checkpoint, a cache rebuild) invalidates the
//! cursor, and the next calculation replays the whole log over the
//! checkpoint state.
//!
//! Applied ops are reported two ways: the incremental path hands back the
//! flattened ops of the transactions that actually applied; the full
//! recompute path defers to a reconcile diff between the pre-invalidation
//! state and the new state, computed only if someone asks.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::doc::MapRead;
use crate::draft::{Draft, Validator};
use crate::error::FatalError;
use crate::log_cache::{InsertOutcome, SortedLog};
use crate::op::Op;
use crate::reconcile::reconcile_ops;
use crate::record::{CheckpointRecord, TxRecord};
use crate::value::Value;

/// How an insertion interacted with the applied prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// Key already cached; nothing changed.
    Duplicate,
    /// Key landed beyond the applied prefix; incremental derivation holds.
    Appended,
    /// Key landed inside the applied prefix; the cursor was invalidated.
    Invalidated,
}

/// Ops that contributed to the latest derived state.
#[derive(Debug)]
pub enum AppliedOps {
    /// Flattened ops of the transactions applied incrementally.
    Incremental(Vec<Op>),
    /// Full recompute: the delta is the reconcile diff between the two
    /// states, computed on demand.
    Recalc {
        /// State before the recompute.
        from: Value,
        /// State after the recompute.
        to: Value,
    },
}

impl AppliedOps {
    /// Materializes the op list.
    ///
    /// # Errors
    ///
    /// Propagates reconciliation failures; unreachable in practice because
    /// both recompute endpoints are objects.
    pub fn resolve(&self) -> Result<Vec<Op>, FatalError> {
        match self {
            Self::Incremental(ops) => Ok(ops.clone()),
            Self::Recalc { from, to } => reconcile_ops(from, to),
        }
    }
}

/// Result of one state calculation.
#[derive(Debug)]
pub struct CalcResult {
    /// The derived state.
    pub state: Value,
    /// Ops that produced it relative to the previous derived state.
    pub applied_ops: AppliedOps,
}

/// Base checkpoint + sorted log incremental state calculator.
#[derive(Debug)]
pub struct StateCalculator {
    log: SortedLog,
    /// Length of the integrated prefix; `None` forces a full recompute.
    applied: Option<usize>,
    cached: Value,
    base_key: Option<String>,
    base: Option<CheckpointRecord>,
    applied_dedup: FxHashSet<String>,
    max_seen_clock: u64,
}

impl Default for StateCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCalculator {
    /// Creates an empty calculator. The first calculation runs the full
    /// path over whatever the cache holds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: SortedLog::default(),
            applied: None,
            cached: Value::empty_object(),
            base_key: None,
            base: None,
            applied_dedup: FxHashSet::default(),
            max_seen_clock: 0,
        }
    }

    /// The most recently derived state.
    #[must_use]
    pub fn state(&self) -> &Value {
        &self.cached
    }

    /// Highest Lamport clock observed in any cached transaction.
    #[must_use]
    pub fn max_seen_clock(&self) -> u64 {
        self.max_seen_clock
    }

    /// The canonical checkpoint key currently used as base.
    #[must_use]
    pub fn base_key(&self) -> Option<&str> {
        self.base_key.as_deref()
    }

    /// The checkpoint record currently used as base.
    #[must_use]
    pub fn base(&self) -> Option<&CheckpointRecord> {
        self.base.as_ref()
    }

    pub(crate) fn log(&self) -> &SortedLog {
        &self.log
    }

    pub(crate) fn log_mut(&mut self) -> &mut SortedLog {
        &mut self.log
    }

    /// Inserts a transaction key into the cache.
    ///
    /// No-op when already present. Bumps the max-seen clock and invalidates
    /// the cursor when the entry sorts into the applied region.
    pub fn insert_tx(&mut self, key: &str) -> Result<InsertStatus, FatalError> {
        match self.log.insert(key)? {
            InsertOutcome::Duplicate => Ok(InsertStatus::Duplicate),
            InsertOutcome::Inserted { position } => {
                let clock = self.log.entries()[position].ts().clock;
                self.max_seen_clock = self.max_seen_clock.max(clock);
                if self.applied.is_some_and(|n| position < n) {
                    self.applied = None;
                    return Ok(InsertStatus::Invalidated);
                }
                Ok(InsertStatus::Appended)
            }
        }
    }

    /// Removes transaction keys from the cache, invalidating the cursor
    /// when any removal lands inside the applied prefix.
    pub fn remove_txs(&mut self, keys: &[String]) {
        if let (Some(position), Some(n)) = (self.log.remove_many(keys), self.applied) {
            if position < n {
                self.applied = None;
            }
        }
    }

    /// Swaps the base checkpoint. No-op when the canonical key is
    /// unchanged; otherwise invalidates the cursor.
    pub fn set_base_checkpoint(&mut self, checkpoint: Option<(String, CheckpointRecord)>) {
        let new_key = checkpoint.as_ref().map(|(key, _)| key.clone());
        if new_key == self.base_key {
            return;
        }
        self.base_key = new_key;
        self.base = checkpoint.map(|(_, record)| record);
        self.applied = None;
    }

    /// Rebuilds the cache from the shared map and invalidates the cursor.
    pub fn rebuild_from_map(&mut self, map: &dyn MapRead<TxRecord>) -> Result<(), FatalError> {
        self.log.rebuild(map.keys())?;
        self.max_seen_clock = self.max_seen_clock.max(self.log.max_clock());
        self.applied = None;
        Ok(())
    }

    /// Derives the current state.
    ///
    /// Incremental when the cursor is valid, otherwise a full replay over
    /// the base checkpoint's state. Transactions whose dedup identity was
    /// already applied or is covered by the base watermarks are skipped;
    /// rejected transactions are skipped silently.
    pub fn calculate(
        &mut self,
        map: &dyn MapRead<TxRecord>,
        validate: Option<&Validator>,
    ) -> Result<CalcResult, FatalError> {
        let full = self.applied.is_none();
        let previous = self.cached.clone();
        if full {
            self.applied_dedup.clear();
            self.cached = self
                .base
                .as_ref()
                .map_or_else(Value::empty_object, |cp| cp.state.clone());
            self.applied = Some(0);
        }
        let start = self.applied.unwrap_or(0);

        let mut draft = Draft::new(self.cached.clone());
        let mut applied_ops: Vec<Op> = Vec::new();
        for i in start..self.log.len() {
            let (dedup_key, dedup_ts) = {
                let entry = &mut self.log.entries_mut()[i];
                let dedup = entry.dedup(map)?;
                (dedup.key.clone(), dedup.ts.clone())
            };
            if self.applied_dedup.contains(&dedup_key) {
                continue;
            }
            if self
                .base
                .as_ref()
                .is_some_and(|cp| cp.covers(&dedup_ts.client_id, dedup_ts.clock))
            {
                self.applied_dedup.insert(dedup_key);
                continue;
            }
            let own_key = self.log.entries()[i].key().to_owned();
            let Some(record) = map.get(&own_key) else {
                // Record left the map after the key entered the cache.
                self.applied_dedup.insert(dedup_key);
                continue;
            };
            match draft.apply_tx(&record.ops, validate) {
                Ok(()) => applied_ops.extend(record.ops.iter().cloned()),
                Err(reason) => trace!(key = %own_key, %reason, "transaction rejected"),
            }
            self.applied_dedup.insert(dedup_key);
        }
        self.applied = Some(self.log.len());
        self.cached = draft.into_root();

        let applied_ops = if full {
            AppliedOps::Recalc {
                from: previous,
                to: self.cached.clone(),
            }
        } else {
            AppliedOps::Incremental(applied_ops)
        };
        Ok(CalcResult {
            state: self.cached.clone(),
            applied_ops,
        })
    }
}
