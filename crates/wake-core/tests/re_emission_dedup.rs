// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Re-emission of transactions missed by a checkpoint, and the dedup that
//! keeps them single-application.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use wake_core::{Op, Path, StateLog, TxTimestamp, Value};
use wake_memdoc::{Hub, MemDoc};

fn peer(client: &str) -> StateLog<MemDoc> {
    StateLog::<MemDoc>::builder()
        .client_id(client)
        .build(MemDoc::new())
        .unwrap()
}

#[test]
fn checkpoint_that_misses_a_transaction_triggers_re_emission() {
    let mut a = peer("a");
    let mut b = peer("b");
    let mut hub = Hub::new();

    // A's writes exist only on A; B finalizes epoch 0 without them.
    a.emit(vec![Op::set(Path::root(), "items", Value::empty_array())])
        .unwrap();
    a.emit(vec![Op::splice(
        Path::of(["items"]),
        0,
        0,
        vec![Value::from("v")],
    )])
    .unwrap();
    b.emit(vec![Op::set(Path::root(), "w", 2)]).unwrap();
    b.compact().unwrap();
    assert_eq!(b.finalized_epoch().unwrap(), Some(0));

    hub.sync(&mut [&mut a, &mut b]).unwrap();

    let expected = Value::object_from([
        ("items", Value::array_from(["v"])),
        ("w", Value::from(2)),
    ]);
    assert_eq!(a.state().unwrap(), expected);
    assert_eq!(b.state().unwrap(), expected);

    // A's missed transactions now live in the active epoch as re-emissions
    // pointing back at their original keys; nothing from epoch 0 remains.
    let doc = a.doc().clone();
    let mut re_emissions = 0;
    for key in doc.tx_keys() {
        let ts = TxTimestamp::parse(&key).unwrap();
        assert!(ts.epoch > 0, "finalized-epoch transaction survived: {key}");
        if let Some(record) = doc.tx_record(&key) {
            if let Some(original) = record.original_key {
                let original_ts = TxTimestamp::parse(&original).unwrap();
                assert_eq!(original_ts.epoch, 0);
                assert_eq!(original_ts.client_id, "a");
                re_emissions += 1;
            }
        }
    }
    assert!(re_emissions >= 2, "expected A's writes to be re-emitted");
}

#[test]
fn observer_of_original_and_re_emission_applies_once() {
    let mut a = peer("a");
    let mut b = peer("b");
    let mut c = peer("c");
    let mut hub = Hub::new();

    // Seed the array everywhere so the splice below resolves on every peer.
    a.emit(vec![Op::set(Path::root(), "items", Value::empty_array())])
        .unwrap();
    hub.sync(&mut [&mut a, &mut b, &mut c]).unwrap();

    // A's splice reaches C but not the compacting peer B in time: emit it,
    // deliver it over an A<->C side channel, then let B finalize without
    // it. (Hub cursors are positional, so the side channel is its own hub.)
    a.emit(vec![Op::splice(
        Path::of(["items"]),
        0,
        0,
        vec![Value::from("once")],
    )])
    .unwrap();
    let mut side_channel = Hub::new();
    side_channel.sync(&mut [&mut a, &mut c]).unwrap();
    b.compact().unwrap();
    hub.sync(&mut [&mut a, &mut b, &mut c]).unwrap();

    // C observed the original, its deletion, and one or more re-emissions
    // sharing the original's dedup key. The splice must land exactly once.
    for log in [&a, &b, &c] {
        let items = log.state().unwrap();
        let items = items.resolve(&Path::of(["items"])).unwrap();
        assert_eq!(
            items.as_array().unwrap().len(),
            1,
            "dedup failed on {}",
            log.client_id()
        );
    }
}

#[test]
fn concurrent_re_emitters_still_deduplicate() {
    let mut a = peer("a");
    let mut b = peer("b");
    let mut c = peer("c");
    let mut hub = Hub::new();

    a.emit(vec![Op::set(Path::root(), "items", Value::empty_array())])
        .unwrap();
    hub.sync(&mut [&mut a, &mut b, &mut c]).unwrap();

    a.emit(vec![Op::splice(
        Path::of(["items"]),
        0,
        0,
        vec![Value::from("x")],
    )])
    .unwrap();
    // B and C both finalize their own view concurrently; afterwards both
    // may re-emit A's missed splice under different keys with the same
    // original key.
    b.compact().unwrap();
    c.compact().unwrap();
    hub.sync(&mut [&mut a, &mut b, &mut c]).unwrap();

    let expected = {
        let items = a.state().unwrap();
        items
            .resolve(&Path::of(["items"]))
            .unwrap()
            .as_array()
            .unwrap()
            .len()
    };
    assert_eq!(expected, 1, "splice applied more than once after dedup");
    assert_eq!(a.state().unwrap(), b.state().unwrap());
    assert_eq!(a.state().unwrap(), c.state().unwrap());
}
