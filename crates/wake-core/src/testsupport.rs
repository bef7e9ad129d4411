// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Unit-test doubles for the shared-map interfaces.
//!
//! Integration tests use the full in-memory collaborator from
//! `wake-memdoc`; unit tests only need a plain map.

use std::collections::BTreeMap;

use crate::doc::{MapRead, MapWrite, OriginTag, ReplicatedDoc};
use crate::record::{CheckpointRecord, TxRecord};

/// Deterministically ordered in-process map double.
#[derive(Debug)]
pub(crate) struct FakeMap<V>(pub BTreeMap<String, V>);

impl<V> Default for FakeMap<V> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<V: Clone> MapRead<V> for FakeMap<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.0.get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn for_each(&self, f: &mut dyn FnMut(&str, &V)) {
        for (k, v) in &self.0 {
            f(k, v);
        }
    }
}

impl<V: Clone> MapWrite<V> for FakeMap<V> {
    fn insert(&mut self, key: &str, value: V) {
        self.0.insert(key.to_owned(), value);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.0.remove(key).is_some()
    }
}

/// Single-process replicated-document double with no delivery at all.
#[derive(Debug, Default)]
pub(crate) struct FakeDoc {
    pub tx: FakeMap<TxRecord>,
    pub cp: FakeMap<CheckpointRecord>,
}

impl ReplicatedDoc for FakeDoc {
    fn read<R>(
        &self,
        f: impl FnOnce(&dyn MapRead<TxRecord>, &dyn MapRead<CheckpointRecord>) -> R,
    ) -> R {
        f(&self.tx, &self.cp)
    }

    fn transact<R>(
        &mut self,
        _origin: Option<&OriginTag>,
        f: impl FnOnce(&mut dyn MapWrite<TxRecord>, &mut dyn MapWrite<CheckpointRecord>) -> R,
    ) -> R {
        f(&mut self.tx, &mut self.cp)
    }
}
