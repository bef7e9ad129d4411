// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! wake-memdoc: in-memory reference collaborator for wake-core.
//!
//! The engine consumes its replicated document through the narrow
//! [`ReplicatedDoc`] interface; this crate provides the in-process
//! implementation used by the test suite and by single-process embedders:
//!
//! - [`MemDoc`]: a cloneable handle over two shared maps with an atomic
//!   transaction primitive. Every transaction appends one change batch to a
//!   journal, tagged with the caller's origin.
//! - [`Hub`]: an N-peer delivery loop that replays each peer's journal to
//!   every other peer in order (causal, per-sender FIFO) and feeds the
//!   resulting key-level changes into the receiving controller. A peer
//!   never hears its own batches, which is exactly the loopback filtering
//!   the engine's origin tags ask for.
//! - [`ManualClock`]: a settable wall clock for retention tests.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::trace;
use wake_core::{
    CheckpointRecord, FatalError, LogChanges, MapRead, MapWrite, OriginTag, ReplicatedDoc,
    StateLog, TxKeyChanges, TxRecord, WallClock, DEFAULT_CHECKPOINT_MAP_NAME, DEFAULT_TX_MAP_NAME,
};

/// One shared map plus the mutations pending for the current transaction.
#[derive(Debug)]
struct Store<V> {
    map: BTreeMap<String, V>,
    pending: Vec<(String, Option<V>)>,
}

impl<V> Default for Store<V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            pending: Vec::new(),
        }
    }
}

impl<V: Clone> MapRead<V> for Store<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.map.get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn for_each(&self, f: &mut dyn FnMut(&str, &V)) {
        for (k, v) in &self.map {
            f(k, v);
        }
    }
}

impl<V: Clone> MapWrite<V> for Store<V> {
    fn insert(&mut self, key: &str, value: V) {
        self.map.insert(key.to_owned(), value.clone());
        self.pending.push((key.to_owned(), Some(value)));
    }

    fn remove(&mut self, key: &str) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.pending.push((key.to_owned(), None));
        }
        removed
    }
}

/// One committed transaction's mutations, as delivered to remote peers.
#[derive(Debug, Clone)]
struct Batch {
    origin: Option<String>,
    tx: Vec<(String, Option<TxRecord>)>,
    cp: Vec<(String, Option<CheckpointRecord>)>,
}

#[derive(Debug, Default)]
struct DocInner {
    tx_name: String,
    cp_name: String,
    tx: Store<TxRecord>,
    cp: Store<CheckpointRecord>,
    journal: Vec<Batch>,
}

/// Key-level effect of applying one remote batch.
#[derive(Debug, Default)]
struct RemoteChanges {
    tx: TxKeyChanges,
    any: bool,
}

/// Cloneable handle to an in-memory replicated document.
///
/// All clones share the same underlying maps; the engine and the delivery
/// hub hold separate handles to one document per peer.
#[derive(Debug, Clone)]
pub struct MemDoc {
    inner: Rc<RefCell<DocInner>>,
}

impl Default for MemDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDoc {
    /// Creates a document with the default map names.
    #[must_use]
    pub fn new() -> Self {
        Self::with_map_names(DEFAULT_TX_MAP_NAME, DEFAULT_CHECKPOINT_MAP_NAME)
    }

    /// Creates a document with custom map names.
    #[must_use]
    pub fn with_map_names(tx_name: &str, cp_name: &str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(DocInner {
                tx_name: tx_name.to_owned(),
                cp_name: cp_name.to_owned(),
                ..DocInner::default()
            })),
        }
    }

    /// Name of the transaction log map.
    #[must_use]
    pub fn tx_map_name(&self) -> String {
        self.inner.borrow().tx_name.clone()
    }

    /// Name of the checkpoint map.
    #[must_use]
    pub fn checkpoint_map_name(&self) -> String {
        self.inner.borrow().cp_name.clone()
    }

    /// Current transaction keys, sorted.
    #[must_use]
    pub fn tx_keys(&self) -> Vec<String> {
        self.inner.borrow().tx.map.keys().cloned().collect()
    }

    /// Current checkpoint keys, sorted.
    #[must_use]
    pub fn checkpoint_keys(&self) -> Vec<String> {
        self.inner.borrow().cp.map.keys().cloned().collect()
    }

    /// Clones the transaction record stored under `key`.
    #[must_use]
    pub fn tx_record(&self, key: &str) -> Option<TxRecord> {
        self.inner.borrow().tx.map.get(key).cloned()
    }

    /// Clones the checkpoint record stored under `key`.
    #[must_use]
    pub fn checkpoint_record(&self, key: &str) -> Option<CheckpointRecord> {
        self.inner.borrow().cp.map.get(key).cloned()
    }

    /// Number of committed change batches in the journal.
    fn journal_len(&self) -> usize {
        self.inner.borrow().journal.len()
    }

    /// Clones the journal suffix starting at `from`.
    fn batches_since(&self, from: usize) -> Vec<Batch> {
        self.inner.borrow().journal[from..].to_vec()
    }

    /// Applies a remote batch last-writer-wins, without journaling it, and
    /// reports the key-level changes (an overwrite counts as delete+add).
    fn apply_remote(&self, batch: &Batch) -> RemoteChanges {
        let mut inner = self.inner.borrow_mut();
        let mut changes = RemoteChanges::default();
        for (key, value) in &batch.tx {
            match value {
                Some(record) => {
                    let existed = inner.tx.map.insert(key.clone(), record.clone()).is_some();
                    if existed {
                        changes.tx.deleted.push(key.clone());
                    }
                    changes.tx.added.push(key.clone());
                    changes.any = true;
                }
                None => {
                    if inner.tx.map.remove(key).is_some() {
                        changes.tx.deleted.push(key.clone());
                        changes.any = true;
                    }
                }
            }
        }
        for (key, value) in &batch.cp {
            match value {
                Some(record) => {
                    inner.cp.map.insert(key.clone(), record.clone());
                    changes.any = true;
                }
                None => {
                    if inner.cp.map.remove(key).is_some() {
                        changes.any = true;
                    }
                }
            }
        }
        changes
    }
}

impl ReplicatedDoc for MemDoc {
    fn read<R>(
        &self,
        f: impl FnOnce(&dyn MapRead<TxRecord>, &dyn MapRead<CheckpointRecord>) -> R,
    ) -> R {
        let inner = self.inner.borrow();
        f(&inner.tx, &inner.cp)
    }

    fn transact<R>(
        &mut self,
        origin: Option<&OriginTag>,
        f: impl FnOnce(&mut dyn MapWrite<TxRecord>, &mut dyn MapWrite<CheckpointRecord>) -> R,
    ) -> R {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let result = f(&mut inner.tx, &mut inner.cp);
        let tx = std::mem::take(&mut inner.tx.pending);
        let cp = std::mem::take(&mut inner.cp.pending);
        if !tx.is_empty() || !cp.is_empty() {
            trace!(
                tx_mutations = tx.len(),
                cp_mutations = cp.len(),
                "committed change batch"
            );
            inner.journal.push(Batch {
                origin: origin.map(|o| o.label().to_owned()),
                tx,
                cp,
            });
        }
        result
    }
}

/// Settable wall clock shared between a test and its controllers.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<i64>>);

impl ManualClock {
    /// Creates a clock reading `now_ms`.
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self(Rc::new(Cell::new(now_ms)))
    }

    /// Sets the absolute reading.
    pub fn set(&self, now_ms: i64) {
        self.0.set(now_ms);
    }

    /// Advances the reading.
    pub fn advance(&self, delta_ms: i64) {
        self.0.set(self.0.get() + delta_ms);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.get()
    }
}

/// In-order N-peer delivery loop.
///
/// The hub replays each peer's journal to every other peer, per-sender
/// FIFO, and hands the resulting key changes to the receiving controller.
/// Callers must pass the peers in the same order on every call; cursor
/// state is positional.
#[derive(Debug, Default)]
pub struct Hub {
    /// `cursors[receiver][sender]`: next journal index to deliver.
    cursors: Vec<Vec<usize>>,
}

impl Hub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_capacity(&mut self, peers: usize) {
        self.cursors.resize_with(peers, Vec::new);
        for row in &mut self.cursors {
            row.resize(peers, 0);
        }
    }

    /// Delivers every pending batch until the network is quiescent.
    ///
    /// Integrations may themselves mutate the document (re-emissions,
    /// pruning, checkpoints); the loop keeps draining until no peer has
    /// anything new to hear.
    ///
    /// # Errors
    ///
    /// Propagates the first fatal error raised by a receiving controller.
    pub fn sync(&mut self, peers: &mut [&mut StateLog<MemDoc>]) -> Result<(), FatalError> {
        self.ensure_capacity(peers.len());
        loop {
            let mut delivered = false;
            for receiver in 0..peers.len() {
                for sender in 0..peers.len() {
                    if sender == receiver {
                        // A peer's own batches are loopback; the engine
                        // integrated them at emission time.
                        self.cursors[receiver][sender] = peers[sender].doc().journal_len();
                        continue;
                    }
                    let cursor = self.cursors[receiver][sender];
                    let batches = peers[sender].doc().batches_since(cursor);
                    if batches.is_empty() {
                        continue;
                    }
                    self.cursors[receiver][sender] = cursor + batches.len();
                    let receiver_doc = peers[receiver].doc().clone();
                    let receiver_origin = peers[receiver].origin().label().to_owned();
                    for batch in &batches {
                        if batch.origin.as_deref() == Some(receiver_origin.as_str()) {
                            // Loopback batch for this controller; it already
                            // integrated its own mutation.
                            continue;
                        }
                        let changes = receiver_doc.apply_remote(batch);
                        if changes.any {
                            peers[receiver].handle_changes(&LogChanges::Keys(changes.tx))?;
                        }
                        delivered = true;
                    }
                }
            }
            if !delivered {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn transact_commits_one_batch_per_call() {
        let mut doc = MemDoc::new();
        doc.transact(None, |tx_map, _| {
            tx_map.insert("0;1;a;0", TxRecord::new(Vec::new()));
            tx_map.insert("0;2;a;0", TxRecord::new(Vec::new()));
        });
        doc.transact(None, |tx_map, _| {
            tx_map.remove("0;1;a;0");
        });
        assert_eq!(doc.journal_len(), 2);
        assert_eq!(doc.tx_keys(), vec!["0;2;a;0".to_owned()]);
    }

    #[test]
    fn empty_transactions_do_not_journal() {
        let mut doc = MemDoc::new();
        doc.transact(None, |_, _| {});
        assert_eq!(doc.journal_len(), 0);
    }

    #[test]
    fn remote_application_mirrors_mutations_without_echo() {
        let mut source = MemDoc::new();
        let target = MemDoc::new();
        source.transact(Some(&OriginTag::new("src")), |tx_map, _| {
            tx_map.insert("0;1;a;0", TxRecord::new(Vec::new()));
        });
        for batch in source.batches_since(0) {
            let changes = target.apply_remote(&batch);
            assert!(changes.any);
            assert_eq!(changes.tx.added, vec!["0;1;a;0".to_owned()]);
        }
        assert_eq!(target.tx_keys(), source.tx_keys());
        // Applying remotely does not grow the target's own journal.
        assert_eq!(target.journal_len(), 0);
    }

    #[test]
    fn manual_clock_reads_back_sets_and_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(7);
        assert_eq!(clock.now_ms(), 7);
    }
}
