// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Per-peer sorted cache of the transaction log.
//!
//! The cache is the authoritative local view for state derivation: a vector
//! of entries sorted by (epoch, clock, client id) plus a hash index for
//! O(1) membership. Each entry parses its own timestamp on insertion and
//! resolves its deduplication identity (the original key for re-emissions)
//! lazily against the shared map, caching the result.

use std::cmp::Ordering;
use std::ops::Range;

use rustc_hash::FxHashSet;

use crate::doc::MapRead;
use crate::error::FatalError;
use crate::record::TxRecord;
use crate::timestamp::TxTimestamp;

/// Logical identity of a log entry: the original key for re-emissions,
/// otherwise the entry's own key.
#[derive(Debug, Clone)]
pub(crate) struct Dedup {
    /// Canonical key used to suppress double application.
    pub key: String,
    /// Timestamp parsed from that key.
    pub ts: TxTimestamp,
}

/// One cached log entry.
#[derive(Debug)]
pub(crate) struct LogEntry {
    key: String,
    ts: TxTimestamp,
    dedup: Option<Dedup>,
}

impl LogEntry {
    fn new(key: String) -> Result<Self, FatalError> {
        let ts = TxTimestamp::parse(&key)?;
        Ok(Self {
            key,
            ts,
            dedup: None,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ts(&self) -> &TxTimestamp {
        &self.ts
    }

    /// Resolves and caches the entry's deduplication identity.
    ///
    /// Falls back to the entry's own identity when the record has left the
    /// map (pruned concurrently) or carries no original key.
    pub fn dedup(&mut self, map: &dyn MapRead<TxRecord>) -> Result<&Dedup, FatalError> {
        if self.dedup.is_none() {
            let resolved = match map.get(&self.key).and_then(|record| record.original_key) {
                Some(original) => {
                    let ts = TxTimestamp::parse(&original)?;
                    Dedup { key: original, ts }
                }
                None => Dedup {
                    key: self.key.clone(),
                    ts: self.ts.clone(),
                },
            };
            self.dedup = Some(resolved);
        }
        match &self.dedup {
            Some(dedup) => Ok(dedup),
            // Unreachable: assigned above.
            None => Err(FatalError::MalformedTxKey(self.key.clone())),
        }
    }
}

/// Outcome of inserting a key into the sorted cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// The key was already cached.
    Duplicate,
    /// The key was inserted at `position`.
    Inserted {
        /// Index in the sorted vector after insertion.
        position: usize,
    },
}

/// Sorted vector of log entries plus a hash membership index.
#[derive(Debug, Default)]
pub(crate) struct SortedLog {
    entries: Vec<LogEntry>,
    index: FxHashSet<String>,
}

impl SortedLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [LogEntry] {
        &mut self.entries
    }

    /// Inserts `key` at its sort position.
    ///
    /// The common case is an append (new transactions carry the highest
    /// clock); anything else binary-searches for the position.
    pub fn insert(&mut self, key: &str) -> Result<InsertOutcome, FatalError> {
        if self.index.contains(key) {
            return Ok(InsertOutcome::Duplicate);
        }
        let entry = LogEntry::new(key.to_owned())?;
        let position = match self.entries.last() {
            Some(last) if last.ts.cmp_order(&entry.ts) != Ordering::Greater => self.entries.len(),
            _ => self
                .entries
                .partition_point(|e| e.ts.cmp_order(&entry.ts) != Ordering::Greater),
        };
        self.index.insert(entry.key.clone());
        self.entries.insert(position, entry);
        Ok(InsertOutcome::Inserted { position })
    }

    /// Removes every listed key in one pass.
    ///
    /// Returns the smallest original position that was removed, when any.
    pub fn remove_many(&mut self, keys: &[String]) -> Option<usize> {
        if keys.is_empty() {
            return None;
        }
        let victims: FxHashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut min_removed = None;
        let mut kept = Vec::with_capacity(self.entries.len());
        for (position, entry) in self.entries.drain(..).enumerate() {
            if victims.contains(entry.key()) {
                self.index.remove(entry.key());
                if min_removed.is_none() {
                    min_removed = Some(position);
                }
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        min_removed
    }

    /// Replaces the cache contents with `keys`, sorted.
    pub fn rebuild(&mut self, keys: Vec<String>) -> Result<(), FatalError> {
        let mut entries = keys
            .into_iter()
            .map(LogEntry::new)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.ts.cmp_order(&b.ts));
        self.index = entries.iter().map(|e| e.key.clone()).collect();
        self.entries = entries;
        Ok(())
    }

    /// Index range of entries in exactly `epoch`.
    ///
    /// Past epochs are pruned eagerly and future epochs only ever appear at
    /// the tail, so the scan walks from the right.
    pub fn epoch_range(&self, epoch: u64) -> Range<usize> {
        let mut end = self.entries.len();
        while end > 0 && self.entries[end - 1].ts.epoch > epoch {
            end -= 1;
        }
        let mut start = end;
        while start > 0 && self.entries[start - 1].ts.epoch == epoch {
            start -= 1;
        }
        start..end
    }

    /// Highest clock among cached entries, by own timestamps.
    pub fn max_clock(&self) -> u64 {
        self.entries.iter().map(|e| e.ts.clock).max().unwrap_or(0)
    }
}
