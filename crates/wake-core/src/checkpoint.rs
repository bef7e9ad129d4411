// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Epoch finalization and the checkpoint store.
//!
//! Checkpoints compact the log: a checkpoint absorbs every transaction of
//! its epoch into a state snapshot plus per-client watermarks. Per epoch
//! exactly one checkpoint is canonical (highest tx count, ties broken by
//! smallest client id); the rest are garbage. The active epoch is always
//! `finalized + 1`.

use tracing::debug;

use crate::calculator::StateCalculator;
use crate::doc::{MapRead, MapWrite};
use crate::error::FatalError;
use crate::record::{CheckpointRecord, TxRecord, Watermark};
use crate::retention::Retention;
use crate::timestamp::CheckpointKey;
use crate::value::Value;

/// Snapshot of the checkpoint map: the finalized epoch and its canonical
/// checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CheckpointView {
    /// Highest epoch with any checkpoint; `None` when the map is empty.
    pub finalized_epoch: Option<u64>,
    /// The canonical checkpoint for that epoch.
    pub canonical: Option<(CheckpointKey, CheckpointRecord)>,
}

impl CheckpointView {
    /// The epoch new transactions are emitted into.
    #[must_use]
    pub fn active_epoch(&self) -> u64 {
        self.finalized_epoch.map_or(0, |epoch| epoch + 1)
    }

    /// Whether the canonical checkpoint differs between two views: a
    /// different finalized epoch, a different canonical tx count, or one
    /// side lacking a canonical at all.
    #[must_use]
    pub fn canonical_changed(&self, other: &Self) -> bool {
        if self.finalized_epoch != other.finalized_epoch {
            return true;
        }
        match (&self.canonical, &other.canonical) {
            (None, None) => false,
            (Some((a, _)), Some((b, _))) => a.tx_count != b.tx_count,
            _ => true,
        }
    }
}

/// Computes the finalized epoch and canonical checkpoint in one pass.
///
/// # Errors
///
/// [`FatalError::MalformedCheckpointKey`] when the map holds a key this
/// engine could not have written.
pub fn finalized_epoch_and_canonical(
    map: &dyn MapRead<CheckpointRecord>,
) -> Result<CheckpointView, FatalError> {
    let mut best: Option<CheckpointKey> = None;
    for key in map.keys() {
        let parsed = CheckpointKey::parse(&key)?;
        let better = match &best {
            None => true,
            Some(current) => {
                parsed.epoch > current.epoch
                    || (parsed.epoch == current.epoch
                        && (parsed.tx_count > current.tx_count
                            || (parsed.tx_count == current.tx_count
                                && parsed.client_id < current.client_id)))
            }
        };
        if better {
            best = Some(parsed);
        }
    }
    let Some(key) = best else {
        return Ok(CheckpointView::default());
    };
    let canonical = map.get(&key.key()).map(|record| (key.clone(), record));
    Ok(CheckpointView {
        finalized_epoch: Some(key.epoch),
        canonical,
    })
}

/// Deletes every checkpoint except the canonical one for the finalized
/// epoch.
pub fn prune_checkpoints(map: &mut dyn MapWrite<CheckpointRecord>, view: &CheckpointView) {
    let Some((canonical_key, _)) = &view.canonical else {
        return;
    };
    let keep = canonical_key.key();
    for key in map.keys() {
        if key != keep {
            map.remove(&key);
            debug!(%key, "pruned non-canonical checkpoint");
        }
    }
}

/// A freshly created checkpoint and the log keys it absorbed.
#[derive(Debug)]
pub(crate) struct CheckpointOutcome {
    /// Key the checkpoint was stored under.
    pub key: CheckpointKey,
    /// Transaction keys deleted from the shared log.
    pub absorbed: Vec<String>,
}

/// Finalizes the active epoch into a checkpoint.
///
/// Returns `None` without side effects when the active epoch holds no
/// transactions. Otherwise folds the epoch slice into watermarks (carrying
/// the previous canonical watermarks forward, pruning those idle past the
/// retention window), stores the checkpoint, and deletes the absorbed
/// transactions from both the shared map and the calculator's cache.
pub(crate) fn create_checkpoint(
    tx_map: &mut dyn MapWrite<TxRecord>,
    cp_map: &mut dyn MapWrite<CheckpointRecord>,
    calc: &mut StateCalculator,
    view: &CheckpointView,
    current_state: &Value,
    client_id: &str,
    retention: Retention,
) -> Option<CheckpointOutcome> {
    let active_epoch = view.active_epoch();
    let range = calc.log().epoch_range(active_epoch);
    if range.is_empty() {
        return None;
    }

    let mut watermarks = view
        .canonical
        .as_ref()
        .map(|(_, record)| record.watermarks.clone())
        .unwrap_or_default();
    let mut min_wall_clock = i64::MAX;
    let slice = &calc.log().entries()[range.clone()];
    let tx_count = slice.len() as u64;
    for entry in slice {
        let ts = entry.ts();
        min_wall_clock = min_wall_clock.min(ts.wall_clock);
        let advance = watermarks
            .get(ts.client_id.as_str())
            .is_none_or(|w| ts.clock > w.max_clock);
        if advance {
            watermarks.insert(
                ts.client_id.clone(),
                Watermark {
                    max_clock: ts.clock,
                    max_wall_clock: ts.wall_clock,
                },
            );
        }
    }
    watermarks.retain(|_, w| !retention.prunes_watermark(min_wall_clock, w));

    let absorbed: Vec<String> = slice.iter().map(|e| e.key().to_owned()).collect();
    let key = CheckpointKey {
        epoch: active_epoch,
        tx_count,
        client_id: client_id.to_owned(),
    };
    cp_map.insert(
        &key.key(),
        CheckpointRecord {
            state: current_state.clone(),
            watermarks,
            tx_count,
            min_wall_clock,
        },
    );
    for tx_key in &absorbed {
        tx_map.remove(tx_key);
    }
    calc.remove_txs(&absorbed);
    debug!(
        epoch = active_epoch,
        tx_count,
        "finalized epoch into checkpoint"
    );
    Some(CheckpointOutcome { key, absorbed })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;

    use super::*;
    use crate::op::Op;
    use crate::testsupport::FakeMap;
    use crate::value::Path;

    fn record(tx_count: u64, min_wall_clock: i64) -> CheckpointRecord {
        CheckpointRecord {
            state: Value::empty_object(),
            watermarks: BTreeMap::new(),
            tx_count,
            min_wall_clock,
        }
    }

    #[test]
    fn empty_map_has_no_finalized_epoch() {
        let map = FakeMap::<CheckpointRecord>::default();
        let view = finalized_epoch_and_canonical(&map).unwrap();
        assert_eq!(view.finalized_epoch, None);
        assert!(view.canonical.is_none());
        assert_eq!(view.active_epoch(), 0);
    }

    #[test]
    fn canonical_prefers_high_tx_count_then_small_client() {
        let mut map = FakeMap::<CheckpointRecord>::default();
        map.0.insert("1;5;zed".to_owned(), record(5, 0));
        map.0.insert("1;9;mid".to_owned(), record(9, 0));
        map.0.insert("1;9;abc".to_owned(), record(9, 0));
        map.0.insert("0;99;old".to_owned(), record(99, 0));
        let view = finalized_epoch_and_canonical(&map).unwrap();
        assert_eq!(view.finalized_epoch, Some(1));
        assert_eq!(view.canonical.unwrap().0.key(), "1;9;abc");
    }

    #[test]
    fn malformed_checkpoint_key_is_fatal() {
        let mut map = FakeMap::<CheckpointRecord>::default();
        map.0.insert("garbage".to_owned(), record(1, 0));
        assert!(matches!(
            finalized_epoch_and_canonical(&map),
            Err(FatalError::MalformedCheckpointKey(_))
        ));
    }

    #[test]
    fn prune_keeps_only_the_canonical() {
        let mut map = FakeMap::<CheckpointRecord>::default();
        map.0.insert("0;3;a".to_owned(), record(3, 0));
        map.0.insert("1;2;a".to_owned(), record(2, 0));
        map.0.insert("1;4;b".to_owned(), record(4, 0));
        let view = finalized_epoch_and_canonical(&map).unwrap();
        prune_checkpoints(&mut map, &view);
        assert_eq!(map.0.len(), 1);
        assert!(map.0.contains_key("1;4;b"));
    }

    #[test]
    fn create_checkpoint_absorbs_the_active_epoch() {
        let mut tx_map = FakeMap::<TxRecord>::default();
        let mut cp_map = FakeMap::<CheckpointRecord>::default();
        let mut calc = StateCalculator::new();

        for (clock, client, wall) in [(1u64, "a", 100i64), (2, "b", 50), (3, "a", 200)] {
            let key = format!("0;{clock};{client};{wall}");
            tx_map.0.insert(
                key.clone(),
                TxRecord::new(vec![Op::set(Path::root(), "x", 1)]),
            );
            calc.insert_tx(&key).unwrap();
        }
        let state = Value::object_from([("x", 1)]);

        let view = CheckpointView::default();
        let outcome = create_checkpoint(
            &mut tx_map,
            &mut cp_map,
            &mut calc,
            &view,
            &state,
            "me",
            Retention::Infinite,
        )
        .unwrap();

        assert_eq!(outcome.key.key(), "0;3;me");
        assert_eq!(outcome.absorbed.len(), 3);
        assert!(tx_map.0.is_empty());
        assert_eq!(calc.log().len(), 0);

        let stored = cp_map.0.get("0;3;me").unwrap();
        assert_eq!(stored.min_wall_clock, 50);
        assert_eq!(stored.watermarks["a"].max_clock, 3);
        assert_eq!(stored.watermarks["a"].max_wall_clock, 200);
        assert_eq!(stored.watermarks["b"].max_clock, 2);
        assert_eq!(stored.state, state);
    }

    #[test]
    fn create_checkpoint_on_empty_epoch_is_a_no_op() {
        let mut tx_map = FakeMap::<TxRecord>::default();
        let mut cp_map = FakeMap::<CheckpointRecord>::default();
        let mut calc = StateCalculator::new();
        let view = CheckpointView::default();
        let outcome = create_checkpoint(
            &mut tx_map,
            &mut cp_map,
            &mut calc,
            &view,
            &Value::empty_object(),
            "me",
            Retention::Infinite,
        );
        assert!(outcome.is_none());
        assert!(cp_map.0.is_empty());
    }

    #[test]
    fn create_checkpoint_prunes_idle_watermarks() {
        let mut tx_map = FakeMap::<TxRecord>::default();
        let mut cp_map = FakeMap::<CheckpointRecord>::default();
        let mut calc = StateCalculator::new();

        // Previous canonical covers an idle client "old" at wall clock 0.
        let mut watermarks = BTreeMap::new();
        watermarks.insert(
            "old".to_owned(),
            Watermark {
                max_clock: 1,
                max_wall_clock: 0,
            },
        );
        let previous = CheckpointRecord {
            state: Value::empty_object(),
            watermarks,
            tx_count: 1,
            min_wall_clock: 0,
        };
        let view = CheckpointView {
            finalized_epoch: Some(0),
            canonical: Some((CheckpointKey::parse("0;1;old").unwrap(), previous)),
        };

        // Active epoch 1 holds one fresh transaction at wall clock 2000.
        let key = "1;5;fresh;2000".to_owned();
        tx_map
            .0
            .insert(key.clone(), TxRecord::new(vec![Op::set(Path::root(), "n", 2)]));
        calc.insert_tx(&key).unwrap();

        let outcome = create_checkpoint(
            &mut tx_map,
            &mut cp_map,
            &mut calc,
            &view,
            &Value::object_from([("n", 2)]),
            "me",
            Retention::Window(1000),
        )
        .unwrap();

        let stored = cp_map.0.get(&outcome.key.key()).unwrap();
        assert!(stored.watermarks.contains_key("fresh"));
        // 2000 - 0 > 1000: the idle client's watermark is gone.
        assert!(!stored.watermarks.contains_key("old"));
    }

    #[test]
    fn canonical_changed_detects_epoch_count_and_nullness() {
        let empty = CheckpointView::default();
        let view_a = CheckpointView {
            finalized_epoch: Some(0),
            canonical: Some((CheckpointKey::parse("0;2;a").unwrap(), record(2, 0))),
        };
        let view_b = CheckpointView {
            finalized_epoch: Some(0),
            canonical: Some((CheckpointKey::parse("0;3;a").unwrap(), record(3, 0))),
        };
        assert!(empty.canonical_changed(&view_a));
        assert!(view_a.canonical_changed(&view_b));
        assert!(!view_a.canonical_changed(&view_a.clone()));
    }
}
