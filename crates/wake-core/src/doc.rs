// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Narrow interfaces to the external replicated-document collaborator.
//!
//! The engine never talks to a transport. It consumes a last-writer-wins
//! replicated document through [`ReplicatedDoc`]: two named string-keyed
//! maps plus an atomic transaction primitive. The collaborator is
//! responsible for inter-peer delivery (causal, in practice a CRDT doc),
//! for observing changes, and for calling back into
//! [`crate::StateLog::handle_changes`] with the key-level change sets,
//! filtering out batches tagged with the engine's own origin.
//!
//! `wake-memdoc` provides the in-memory reference implementation used by
//! tests and single-process embedders.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::record::{CheckpointRecord, TxRecord};

/// Default name for the transaction log map.
pub const DEFAULT_TX_MAP_NAME: &str = "state-sync-log-tx";

/// Default name for the checkpoint map.
pub const DEFAULT_CHECKPOINT_MAP_NAME: &str = "state-sync-log-checkpoint";

/// Opaque origin marker forwarded to the collaborator's transaction
/// primitive so it can filter the engine's own mutations out of the change
/// feed (loopback filtering).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginTag(Rc<str>);

impl OriginTag {
    /// Creates a tag from an arbitrary label.
    #[must_use]
    pub fn new(label: &str) -> Self {
        Self(Rc::from(label))
    }

    /// The tag's label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.0
    }
}

/// Read access to one shared string-keyed map.
pub trait MapRead<V: Clone> {
    /// Returns a clone of the value stored under `key`.
    fn get(&self, key: &str) -> Option<V>;

    /// Returns `true` when `key` is present.
    fn contains(&self, key: &str) -> bool;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Returns `true` when the map holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry. Iteration order is the collaborator's; callers
    /// needing determinism must sort.
    fn for_each(&self, f: &mut dyn FnMut(&str, &V));

    /// Collects all keys.
    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(&mut |k, _| keys.push(k.to_owned()));
        keys
    }
}

/// Write access to one shared string-keyed map. Only valid inside the
/// document's transaction primitive.
pub trait MapWrite<V: Clone>: MapRead<V> {
    /// Inserts or replaces `key`.
    fn insert(&mut self, key: &str, value: V);

    /// Removes `key`, returning whether it was present.
    fn remove(&mut self, key: &str) -> bool;
}

/// The replicated document holding the transaction log and checkpoint maps.
pub trait ReplicatedDoc {
    /// Runs `f` with read access to both maps.
    fn read<R>(&self, f: impl FnOnce(&dyn MapRead<TxRecord>, &dyn MapRead<CheckpointRecord>) -> R)
        -> R;

    /// Runs `f` with write access to both maps, applying all mutations
    /// atomically and delivering them to remote peers as one change batch
    /// tagged with `origin`.
    fn transact<R>(
        &mut self,
        origin: Option<&OriginTag>,
        f: impl FnOnce(&mut dyn MapWrite<TxRecord>, &mut dyn MapWrite<CheckpointRecord>) -> R,
    ) -> R;
}

/// Key-level change set for the transaction map, as delivered by the
/// collaborator's observer. An updated key is reported as delete plus add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxKeyChanges {
    /// Keys added since the last delivery.
    pub added: Vec<String>,
    /// Keys deleted since the last delivery.
    pub deleted: Vec<String>,
}

impl TxKeyChanges {
    /// A change set with a single added key.
    #[must_use]
    pub fn added(key: String) -> Self {
        Self {
            added: vec![key],
            deleted: Vec::new(),
        }
    }
}

/// What the sync engine knows about how the transaction map changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChanges {
    /// No per-key information (first run, or the observer lost track).
    /// Forces a full resynchronization from the map.
    Unknown,
    /// Exact key-level changes.
    Keys(TxKeyChanges),
}

/// Wall-clock source. Consulted only at emission and compaction time; state
/// derivation never reads it.
pub trait WallClock {
    /// Current wall time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|d| i64::try_from(d.as_millis()).ok())
            .unwrap_or(0)
    }
}
