// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Epoch lifecycle: finalization, canonical selection, pruning.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use wake_core::{CheckpointKey, Op, Path, StateLog, TxTimestamp, Value};
use wake_memdoc::{Hub, MemDoc};

fn peer(client: &str) -> StateLog<MemDoc> {
    StateLog::<MemDoc>::builder()
        .client_id(client)
        .build(MemDoc::new())
        .unwrap()
}

#[test]
fn successive_compactions_advance_epochs_and_prune_history() {
    let mut a = peer("a");

    a.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
    a.compact().unwrap();
    assert_eq!(a.finalized_epoch().unwrap(), Some(0));
    assert_eq!(a.active_epoch().unwrap(), 1);

    a.emit(vec![Op::set(Path::root(), "y", 2)]).unwrap();
    a.compact().unwrap();
    assert_eq!(a.finalized_epoch().unwrap(), Some(1));
    assert_eq!(a.active_epoch().unwrap(), 2);

    // Only the latest canonical checkpoint survives.
    let keys = a.doc().checkpoint_keys();
    assert_eq!(keys.len(), 1);
    let key = CheckpointKey::parse(&keys[0]).unwrap();
    assert_eq!(key.epoch, 1);
    assert_eq!(a.state().unwrap(), Value::object_from([("x", 1), ("y", 2)]));
    assert!(a.is_log_empty().unwrap());
}

#[test]
fn no_transaction_at_or_below_the_finalized_epoch_survives() {
    let mut a = peer("a");
    let mut b = peer("b");
    let mut hub = Hub::new();

    a.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();
    b.emit(vec![Op::set(Path::root(), "y", 2)]).unwrap();
    a.compact().unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();

    let finalized = a.finalized_epoch().unwrap().unwrap();
    for log in [&a, &b] {
        for key in log.doc().tx_keys() {
            let ts = TxTimestamp::parse(&key).unwrap();
            assert!(
                ts.epoch > finalized,
                "epoch-{} transaction {key} survived finalization",
                ts.epoch
            );
        }
    }
    assert_eq!(a.state().unwrap(), b.state().unwrap());
    assert_eq!(
        a.state().unwrap(),
        Value::object_from([("x", 1), ("y", 2)])
    );
}

#[test]
fn concurrent_compactions_agree_on_one_canonical_checkpoint() {
    let mut a = peer("a");
    let mut b = peer("b");
    let mut hub = Hub::new();

    a.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
    b.emit(vec![Op::set(Path::root(), "y", 2)]).unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();

    // Both peers finalize epoch 0 with the same two transactions before
    // hearing about each other's checkpoint.
    a.compact().unwrap();
    b.compact().unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();

    // Equal tx counts: the smaller client id wins on every peer.
    let keys_a = a.doc().checkpoint_keys();
    let keys_b = b.doc().checkpoint_keys();
    assert_eq!(keys_a, keys_b);
    assert_eq!(keys_a.len(), 1);
    let canonical = CheckpointKey::parse(&keys_a[0]).unwrap();
    assert_eq!(canonical.client_id, "a");
    assert_eq!(canonical.tx_count, 2);

    let expected = Value::object_from([("x", 1), ("y", 2)]);
    assert_eq!(a.state().unwrap(), expected);
    assert_eq!(b.state().unwrap(), expected);
}

#[test]
fn emissions_continue_cleanly_in_the_next_epoch() {
    let mut a = peer("a");
    let mut b = peer("b");
    let mut hub = Hub::new();

    a.emit(vec![Op::set(Path::root(), "base", 0)]).unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();
    a.compact().unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();

    b.emit(vec![Op::set(Path::root(), "later", 1)]).unwrap();
    hub.sync(&mut [&mut a, &mut b]).unwrap();

    let key = b.doc().tx_keys().pop().unwrap();
    let ts = TxTimestamp::parse(&key).unwrap();
    assert_eq!(ts.epoch, 1, "post-finalization emission targets epoch 1");

    let expected = Value::object_from([("base", 0), ("later", 1)]);
    assert_eq!(a.state().unwrap(), expected);
    assert_eq!(b.state().unwrap(), expected);
    assert_eq!(a.active_epoch_tx_count().unwrap(), 1);
}

#[test]
fn compaction_state_round_trips_through_a_fresh_peer() {
    let mut a = peer("a");
    a.emit(vec![Op::set(
        Path::root(),
        "nested",
        Value::object_from([("deep", Value::array_from([1, 2, 3]))]),
    )])
    .unwrap();
    a.compact().unwrap();

    // A peer joining after compaction derives everything from the
    // checkpoint alone.
    let mut b = peer("b");
    let mut hub = Hub::new();
    hub.sync(&mut [&mut a, &mut b]).unwrap();
    assert_eq!(b.state().unwrap(), a.state().unwrap());
    assert_eq!(b.finalized_epoch().unwrap(), Some(0));
}
