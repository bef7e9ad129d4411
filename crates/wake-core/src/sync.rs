// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The synchronization pipeline that integrates shared-map changes.
//!
//! [`update_state`] runs on every change delivery (and after local emits
//! and compactions) and performs, in order:
//!
//! 1. recompute the checkpoint view and detect a canonical change;
//! 2. bootstrap the sorted cache from the map on the first run;
//! 3. `sync_log`: classify every transaction at or below the finalized
//!    epoch as ancient (delete), covered by watermarks (delete), or missed
//!    (re-emit into the active epoch carrying the original key, then
//!    delete). Re-emissions happen before the batch deletion, all inside
//!    one shared-map transaction;
//! 4. prune non-canonical checkpoints;
//! 5. apply the key-level changes to the sorted cache (or rebuild it when
//!    the change set is unknown) and derive the new state, incrementally
//!    when nothing invalidated the applied prefix.

use std::rc::Rc;

use tracing::{debug, trace};

use crate::calculator::{CalcResult, StateCalculator};
use crate::checkpoint::{finalized_epoch_and_canonical, prune_checkpoints, CheckpointView};
use crate::doc::{LogChanges, MapWrite, OriginTag, ReplicatedDoc};
use crate::draft::Validator;
use crate::error::FatalError;
use crate::log_cache::Dedup;
use crate::op::Op;
use crate::record::{CheckpointRecord, TxRecord};
use crate::retention::Retention;
use crate::timestamp::TxTimestamp;

/// Peer-local parameters threaded through one synchronization pass.
pub(crate) struct SyncConfig<'a> {
    /// This peer's identity.
    pub client_id: &'a str,
    /// Retention window for missed transactions and idle watermarks.
    pub retention: Retention,
    /// Origin tag for loopback filtering by the collaborator.
    pub origin: Option<&'a OriginTag>,
    /// Wall clock reading for re-emissions made during this pass.
    pub now_ms: i64,
}

/// Result of one synchronization pass.
pub(crate) struct SyncOutcome {
    /// The freshly computed checkpoint view.
    pub view: CheckpointView,
    /// The derived state and its contributing ops.
    pub result: CalcResult,
}

/// Fate of a transaction at or below the finalized epoch.
enum Disposition {
    /// Older than the retention window; unconditionally deleted.
    Ancient,
    /// Absorbed by the canonical checkpoint's watermarks; deleted.
    Covered,
    /// Missed by the checkpoint but still fresh; re-emitted.
    Missed,
}

fn classify(
    dedup_ts: &TxTimestamp,
    canonical: Option<&CheckpointRecord>,
    retention: Retention,
) -> Disposition {
    if let Some(checkpoint) = canonical {
        if retention.is_ancient(checkpoint.min_wall_clock, dedup_ts.wall_clock) {
            return Disposition::Ancient;
        }
        if checkpoint.covers(&dedup_ts.client_id, dedup_ts.clock) {
            return Disposition::Covered;
        }
    }
    Disposition::Missed
}

/// Integrates a change delivery and derives the new state.
pub(crate) fn update_state<D: ReplicatedDoc>(
    doc: &mut D,
    calc: &mut StateCalculator,
    prev_view: Option<&CheckpointView>,
    changes: &LogChanges,
    local_clock: &mut u64,
    validate: Option<&Validator>,
    cfg: &SyncConfig<'_>,
) -> Result<SyncOutcome, FatalError> {
    let view = doc.read(|_, cp_map| finalized_epoch_and_canonical(cp_map))?;
    let first_run = prev_view.is_none();
    let canonical_changed = prev_view.is_none_or(|prev| prev.canonical_changed(&view));

    // First run: populate the cache up front so the log scan below walks
    // the same optimized path as every later run.
    if first_run {
        doc.read(|tx_map, _| calc.rebuild_from_map(tx_map))?;
    }

    doc.transact(cfg.origin, |tx_map, cp_map| {
        sync_log(tx_map, calc, &view, changes, local_clock, cfg)?;
        prune_checkpoints(cp_map, &view);
        Ok::<(), FatalError>(())
    })?;

    // Maintain the cache for this delivery. Unknown changes force a rebuild;
    // exact changes are applied key by key (added keys that were pruned
    // during the scan above have left the map and are skipped).
    match changes {
        LogChanges::Unknown if !first_run => {
            doc.read(|tx_map, _| calc.rebuild_from_map(tx_map))?;
        }
        LogChanges::Keys(keys) => {
            calc.remove_txs(&keys.deleted);
            for key in &keys.added {
                if doc.read(|tx_map, _| tx_map.contains(key)) {
                    calc.insert_tx(key)?;
                }
            }
        }
        LogChanges::Unknown => {}
    }

    if first_run || canonical_changed || matches!(changes, LogChanges::Unknown) {
        calc.set_base_checkpoint(
            view.canonical
                .clone()
                .map(|(key, record)| (key.key(), record)),
        );
    }

    let result = doc.read(|tx_map, _| calc.calculate(tx_map, validate))?;
    Ok(SyncOutcome { view, result })
}

/// Classifies and repairs the log against the finalized epoch.
fn sync_log(
    tx_map: &mut dyn MapWrite<TxRecord>,
    calc: &mut StateCalculator,
    view: &CheckpointView,
    changes: &LogChanges,
    local_clock: &mut u64,
    cfg: &SyncConfig<'_>,
) -> Result<(), FatalError> {
    let Some(finalized) = view.finalized_epoch else {
        // No checkpoint exists: every transaction is in the active epoch's
        // future and nothing can be covered or ancient.
        return Ok(());
    };
    let canonical = view.canonical.as_ref().map(|(_, record)| record);

    let mut obsolete: Vec<String> = Vec::new();
    let mut re_emissions: Vec<(String, Rc<[Op]>)> = Vec::new();

    // Scan the sorted cache; physical ordering guarantees everything after
    // the first entry above the finalized epoch is fresh.
    for i in 0..calc.log().len() {
        if calc.log().entries()[i].ts().epoch > finalized {
            break;
        }
        let own_key = calc.log().entries()[i].key().to_owned();
        let dedup = calc.log_mut().entries_mut()[i].dedup(&*tx_map)?.clone();
        match classify(&dedup.ts, canonical, cfg.retention) {
            Disposition::Ancient | Disposition::Covered => obsolete.push(own_key),
            Disposition::Missed => {
                if let Some(record) = tx_map.get(&own_key) {
                    re_emissions.push((dedup.key, record.ops));
                }
                obsolete.push(own_key);
            }
        }
    }

    // Incoming keys not yet cached get the same classification. A key that
    // was pruned while it was in flight is simply gone.
    if let LogChanges::Keys(keys) = changes {
        for key in &keys.added {
            if calc.log().contains(key) {
                continue;
            }
            let Some(record) = tx_map.get(key) else {
                continue;
            };
            let own_ts = TxTimestamp::parse(key)?;
            if own_ts.epoch > finalized {
                continue;
            }
            let dedup = match &record.original_key {
                Some(original) => Dedup {
                    key: original.clone(),
                    ts: TxTimestamp::parse(original)?,
                },
                None => Dedup {
                    key: key.clone(),
                    ts: own_ts,
                },
            };
            match classify(&dedup.ts, canonical, cfg.retention) {
                Disposition::Ancient | Disposition::Covered => obsolete.push(key.clone()),
                Disposition::Missed => {
                    re_emissions.push((dedup.key, record.ops));
                    obsolete.push(key.clone());
                }
            }
        }
    }

    // Re-emit before deleting, so a missed transaction is never absent from
    // the map even transiently.
    for (original, ops) in re_emissions {
        let clock = (*local_clock).max(calc.max_seen_clock()) + 1;
        *local_clock = clock;
        let ts = TxTimestamp {
            epoch: finalized + 1,
            clock,
            client_id: cfg.client_id.to_owned(),
            wall_clock: cfg.now_ms,
        };
        let key = ts.key();
        debug!(original = %original, re_emitted = %key, "re-emitting missed transaction");
        tx_map.insert(&key, TxRecord::re_emission(ops, original));
        calc.insert_tx(&key)?;
    }

    for key in &obsolete {
        tx_map.remove(key);
        trace!(%key, "pruned finalized-epoch transaction");
    }
    calc.remove_txs(&obsolete);
    Ok(())
}
