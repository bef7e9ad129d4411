// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! The peer-facing controller: emit, subscribe, reconcile, compact.
//!
//! A [`StateLog`] owns one peer's view of the replicated document: the
//! state calculator, the Lamport clock, the checkpoint view, and the
//! subscriber list. All entry points run to completion on the caller's
//! task; the engine has no internal concurrency.
//!
//! Change deliveries from the collaborator enter through
//! [`StateLog::handle_changes`]. The collaborator must filter out batches
//! tagged with this controller's [`StateLog::origin`]: local mutations are
//! integrated synchronously by the call that makes them.

use tracing::debug;

use crate::calculator::{CalcResult, StateCalculator};
use crate::checkpoint::{create_checkpoint, CheckpointView};
use crate::doc::{LogChanges, OriginTag, ReplicatedDoc, SystemClock, TxKeyChanges, WallClock};
use crate::draft::Validator;
use crate::error::FatalError;
use crate::ident::{random_client_id, validate_client_id};
use crate::op::Op;
use crate::reconcile::reconcile_ops;
use crate::record::TxRecord;
use crate::retention::Retention;
use crate::sync::{update_state, SyncConfig};
use crate::timestamp::TxTimestamp;
use crate::value::Value;

/// Callback invoked after a change is fully integrated, with the new state
/// and the ops that produced it.
pub type Subscriber = dyn FnMut(&Value, &[Op]);

/// Handle for removing a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fluent builder for [`StateLog`] instances.
///
/// Defaults: a random client id, infinite retention, the system wall
/// clock, no validator, and an origin tag derived from the client id.
pub struct StateLogBuilder {
    client_id: Option<String>,
    retention: Retention,
    origin: Option<OriginTag>,
    validate: Option<Box<Validator>>,
    wall_clock: Box<dyn WallClock>,
}

impl Default for StateLogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StateLogBuilder {
    /// Creates a builder with the defaults above.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client_id: None,
            retention: Retention::Infinite,
            origin: None,
            validate: None,
            wall_clock: Box::new(SystemClock),
        }
    }

    /// Uses a stable client identity instead of a random one.
    #[must_use]
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Overrides the origin tag forwarded to the collaborator's transact.
    #[must_use]
    pub fn origin(mut self, origin: OriginTag) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Installs a pure validation predicate. A transaction whose candidate
    /// state fails the predicate is silently rejected.
    #[must_use]
    pub fn validator(mut self, validate: impl Fn(&Value) -> bool + 'static) -> Self {
        self.validate = Some(Box::new(validate));
        self
    }

    /// Injects a wall-clock source (tests use a manual clock).
    #[must_use]
    pub fn wall_clock(mut self, clock: impl WallClock + 'static) -> Self {
        self.wall_clock = Box::new(clock);
        self
    }

    /// Builds the controller over `doc` and runs the initial full
    /// synchronization.
    ///
    /// # Errors
    ///
    /// [`FatalError::InvalidClientId`] for an id containing `';'`, or any
    /// fatal error surfaced while reading the shared maps.
    pub fn build<D: ReplicatedDoc>(self, doc: D) -> Result<StateLog<D>, FatalError> {
        let client_id = match self.client_id {
            Some(id) => {
                validate_client_id(&id)?;
                id
            }
            None => random_client_id(),
        };
        let origin = self
            .origin
            .unwrap_or_else(|| OriginTag::new(&format!("state-log:{client_id}")));
        let mut log = StateLog {
            doc,
            calc: StateCalculator::new(),
            view: CheckpointView::default(),
            state: Value::empty_object(),
            client_id,
            origin,
            retention: self.retention,
            validate: self.validate,
            wall_clock: self.wall_clock,
            local_clock: 0,
            subscribers: Vec::new(),
            next_subscription: 0,
            disposed: false,
        };
        let now_ms = log.wall_clock.now_ms();
        let cfg = SyncConfig {
            client_id: &log.client_id,
            retention: log.retention,
            origin: Some(&log.origin),
            now_ms,
        };
        let outcome = update_state(
            &mut log.doc,
            &mut log.calc,
            None,
            &LogChanges::Unknown,
            &mut log.local_clock,
            log.validate.as_deref(),
            &cfg,
        )?;
        log.view = outcome.view;
        log.state = outcome.result.state;
        Ok(log)
    }
}

/// One peer's controller over the replicated state log.
pub struct StateLog<D: ReplicatedDoc> {
    doc: D,
    calc: StateCalculator,
    view: CheckpointView,
    state: Value,
    client_id: String,
    origin: OriginTag,
    retention: Retention,
    validate: Option<Box<Validator>>,
    wall_clock: Box<dyn WallClock>,
    local_clock: u64,
    subscribers: Vec<(SubscriptionId, Box<Subscriber>)>,
    next_subscription: u64,
    disposed: bool,
}

impl<D: ReplicatedDoc> StateLog<D> {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> StateLogBuilder {
        StateLogBuilder::new()
    }

    fn ensure_live(&self) -> Result<(), FatalError> {
        if self.disposed {
            return Err(FatalError::Disposed);
        }
        Ok(())
    }

    /// This peer's client identity.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The origin tag the collaborator must use for loopback filtering.
    #[must_use]
    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    /// The underlying replicated-document handle, for the integration
    /// layer that wires observers.
    #[must_use]
    pub fn doc(&self) -> &D {
        &self.doc
    }

    /// Returns the current derived state.
    pub fn state(&self) -> Result<Value, FatalError> {
        self.ensure_live()?;
        Ok(self.state.clone())
    }

    /// Registers a subscriber. Callbacks fire synchronously, in
    /// registration order, only when the state actually changed and at
    /// least one op contributed to the delta.
    pub fn subscribe(
        &mut self,
        callback: impl FnMut(&Value, &[Op]) + 'static,
    ) -> Result<SubscriptionId, FatalError> {
        self.ensure_live()?;
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        Ok(id)
    }

    /// Removes a subscriber, returning whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<bool, FatalError> {
        self.ensure_live()?;
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        Ok(self.subscribers.len() != before)
    }

    /// Emits a transaction into the active epoch.
    ///
    /// An empty op list has no side effects and notifies nobody. Otherwise
    /// the Lamport clock advances past everything observed, the record is
    /// stored under its new key inside a collaborator transaction, and the
    /// change is integrated locally (the collaborator filters the loopback
    /// delivery by origin).
    pub fn emit(&mut self, ops: Vec<Op>) -> Result<(), FatalError> {
        self.ensure_live()?;
        if ops.is_empty() {
            return Ok(());
        }
        let clock = self.local_clock.max(self.calc.max_seen_clock()) + 1;
        self.local_clock = clock;
        let ts = TxTimestamp {
            epoch: self.view.active_epoch(),
            clock,
            client_id: self.client_id.clone(),
            wall_clock: self.wall_clock.now_ms(),
        };
        let key = ts.key();
        debug!(%key, ops = ops.len(), "emitting transaction");
        let record = TxRecord::new(ops);
        self.doc.transact(Some(&self.origin), |tx_map, _| {
            tx_map.insert(&key, record);
        });
        self.integrate(&LogChanges::Keys(TxKeyChanges::added(key)))
    }

    /// Emits the minimal diff that turns the current state into `target`.
    /// A no-op when the states are already structurally equal.
    pub fn reconcile_state(&mut self, target: &Value) -> Result<(), FatalError> {
        self.ensure_live()?;
        let ops = reconcile_ops(&self.state, target)?;
        if ops.is_empty() {
            return Ok(());
        }
        self.emit(ops)
    }

    /// Finalizes the active epoch into a checkpoint.
    ///
    /// A no-op when the active epoch holds no transactions. Otherwise the
    /// checkpoint is stored and the absorbed transactions are deleted, all
    /// inside one collaborator transaction; the derived state is preserved
    /// and subscribers are not notified.
    pub fn compact(&mut self) -> Result<(), FatalError> {
        self.ensure_live()?;
        let outcome = {
            let calc = &mut self.calc;
            let view = &self.view;
            let state = &self.state;
            let client_id = &self.client_id;
            let retention = self.retention;
            self.doc.transact(Some(&self.origin), |tx_map, cp_map| {
                create_checkpoint(tx_map, cp_map, calc, view, state, client_id, retention)
            })
        };
        match outcome {
            None => Ok(()),
            Some(created) => {
                debug!(key = %created.key, "compacted active epoch");
                self.integrate(&LogChanges::Keys(TxKeyChanges::default()))
            }
        }
    }

    /// Integrates a change delivery from the collaborator's observer.
    pub fn handle_changes(&mut self, changes: &LogChanges) -> Result<(), FatalError> {
        self.ensure_live()?;
        self.integrate(changes)
    }

    /// Forces a full resynchronization from the shared maps.
    pub fn resync(&mut self) -> Result<(), FatalError> {
        self.handle_changes(&LogChanges::Unknown)
    }

    /// Epoch new transactions are emitted into.
    pub fn active_epoch(&self) -> Result<u64, FatalError> {
        self.ensure_live()?;
        Ok(self.view.active_epoch())
    }

    /// Highest finalized epoch, when any checkpoint exists.
    pub fn finalized_epoch(&self) -> Result<Option<u64>, FatalError> {
        self.ensure_live()?;
        Ok(self.view.finalized_epoch)
    }

    /// Number of cached transactions in the active epoch.
    pub fn active_epoch_tx_count(&self) -> Result<usize, FatalError> {
        self.ensure_live()?;
        Ok(self.calc.log().epoch_range(self.view.active_epoch()).len())
    }

    /// Earliest wall clock among active-epoch transactions, when any.
    pub fn active_epoch_start_time(&self) -> Result<Option<i64>, FatalError> {
        self.ensure_live()?;
        let range = self.calc.log().epoch_range(self.view.active_epoch());
        Ok(self.calc.log().entries()[range]
            .iter()
            .map(|entry| entry.ts().wall_clock)
            .min())
    }

    /// Whether the shared transaction log is empty.
    pub fn is_log_empty(&self) -> Result<bool, FatalError> {
        self.ensure_live()?;
        Ok(self.doc.read(|tx_map, _| tx_map.is_empty()))
    }

    /// Detaches from the document. Idempotent; every later call on this
    /// controller fails with [`FatalError::Disposed`].
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.subscribers.clear();
        debug!(client_id = %self.client_id, "state log disposed");
    }

    /// Whether [`StateLog::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn integrate(&mut self, changes: &LogChanges) -> Result<(), FatalError> {
        let now_ms = self.wall_clock.now_ms();
        let cfg = SyncConfig {
            client_id: &self.client_id,
            retention: self.retention,
            origin: Some(&self.origin),
            now_ms,
        };
        let outcome = update_state(
            &mut self.doc,
            &mut self.calc,
            Some(&self.view),
            changes,
            &mut self.local_clock,
            self.validate.as_deref(),
            &cfg,
        )?;
        self.view = outcome.view;
        let previous = std::mem::replace(&mut self.state, outcome.result.state.clone());
        self.notify(&previous, &outcome.result)
    }

    /// Notifies subscribers when the state changed and ops contributed.
    fn notify(&mut self, previous: &Value, result: &CalcResult) -> Result<(), FatalError> {
        if self.subscribers.is_empty() || Value::ptr_eq(previous, &self.state) {
            return Ok(());
        }
        let ops = result.applied_ops.resolve()?;
        if ops.is_empty() {
            return Ok(());
        }
        let state = self.state.clone();
        for (_, callback) in &mut self.subscribers {
            callback(&state, &ops);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::testsupport::FakeDoc;
    use crate::value::Path;

    fn new_log(client: &str) -> StateLog<FakeDoc> {
        StateLog::<FakeDoc>::builder()
            .client_id(client)
            .build(FakeDoc::default())
            .unwrap()
    }

    #[test]
    fn basic_set_updates_state_and_log() {
        let mut log = new_log("a");
        log.emit(vec![Op::set(Path::root(), "count", 1)]).unwrap();
        assert_eq!(log.state().unwrap(), Value::object_from([("count", 1)]));
        assert_eq!(log.active_epoch().unwrap(), 0);
        assert!(!log.is_log_empty().unwrap());
        assert_eq!(log.active_epoch_tx_count().unwrap(), 1);
    }

    #[test]
    fn empty_emit_is_a_silent_no_op() {
        let mut log = new_log("a");
        let calls = Rc::new(RefCell::new(0));
        let calls_in = Rc::clone(&calls);
        log.subscribe(move |_, _| *calls_in.borrow_mut() += 1)
            .unwrap();
        log.emit(Vec::new()).unwrap();
        assert_eq!(*calls.borrow(), 0);
        assert!(log.is_log_empty().unwrap());
    }

    #[test]
    fn subscriber_sees_delta_that_reproduces_the_state() {
        let mut log = new_log("a");
        let seen: Rc<RefCell<Vec<(Value, Vec<Op>)>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_in = Rc::clone(&seen);
        log.subscribe(move |state, ops| {
            seen_in.borrow_mut().push((state.clone(), ops.to_vec()));
        })
        .unwrap();

        let mut shadow = Value::empty_object();
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
        log.emit(vec![Op::set(Path::root(), "y", 2)]).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        for (state, ops) in seen.iter() {
            crate::apply::apply_ops_mut(&mut shadow, ops, None).unwrap();
            assert_eq!(&shadow, state);
        }
    }

    #[test]
    fn lamport_clock_strictly_increases_across_emits() {
        let mut log = new_log("a");
        for i in 0..5 {
            log.emit(vec![Op::set(Path::root(), format!("k{i}"), i)])
                .unwrap();
        }
        let mut clocks: Vec<u64> = log.doc.tx.0.keys().map(|key| {
            TxTimestamp::parse(key).unwrap().clock
        }).collect();
        clocks.sort_unstable();
        assert_eq!(clocks, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn reconcile_emits_exactly_the_diff_and_is_idempotent() {
        let mut log = new_log("a");
        log.emit(vec![
            Op::set(Path::root(), "a", 1),
            Op::set(Path::root(), "b", 2),
            Op::set(Path::root(), "c", 3),
        ])
        .unwrap();

        let target = Value::object_from([("a", 1), ("b", 3), ("c", 4), ("d", 5)]);
        log.reconcile_state(&target).unwrap();
        assert_eq!(log.state().unwrap(), target);

        let txs_before = log.doc.tx.0.len();
        log.reconcile_state(&target).unwrap();
        assert_eq!(log.doc.tx.0.len(), txs_before, "idempotent reconcile emits nothing");
    }

    #[test]
    fn compact_preserves_state_and_advances_the_epoch() {
        let mut log = new_log("a");
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
        let before = log.state().unwrap();

        log.compact().unwrap();
        assert_eq!(log.state().unwrap(), before);
        assert_eq!(log.finalized_epoch().unwrap(), Some(0));
        assert_eq!(log.active_epoch().unwrap(), 1);
        assert!(log.is_log_empty().unwrap());
        assert_eq!(log.doc.cp.0.len(), 1);
        assert!(log.doc.cp.0.contains_key("0;1;a"));
    }

    #[test]
    fn compact_on_empty_epoch_is_a_no_op() {
        let mut log = new_log("a");
        log.compact().unwrap();
        assert_eq!(log.finalized_epoch().unwrap(), None);
        assert!(log.doc.cp.0.is_empty());

        // Finalize once, then compact again with an empty active epoch.
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
        log.compact().unwrap();
        log.compact().unwrap();
        assert_eq!(log.finalized_epoch().unwrap(), Some(0));
    }

    #[test]
    fn compact_does_not_notify_subscribers() {
        let mut log = new_log("a");
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
        let calls = Rc::new(RefCell::new(0));
        let calls_in = Rc::clone(&calls);
        log.subscribe(move |_, _| *calls_in.borrow_mut() += 1)
            .unwrap();
        log.compact().unwrap();
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn rejected_validator_transactions_change_nothing() {
        let mut log = StateLog::<FakeDoc>::builder()
            .client_id("a")
            .validator(|state| {
                state
                    .as_object()
                    .is_some_and(|map| !map.contains_key("forbidden"))
            })
            .build(FakeDoc::default())
            .unwrap();
        log.emit(vec![Op::set(Path::root(), "ok", 1)]).unwrap();
        log.emit(vec![Op::set(Path::root(), "forbidden", 1)]).unwrap();
        assert_eq!(log.state().unwrap(), Value::object_from([("ok", 1)]));
        // The rejected record stays in the log until pruned.
        assert_eq!(log.doc.tx.0.len(), 2);
    }

    #[test]
    fn dispose_is_idempotent_and_later_calls_fail() {
        let mut log = new_log("a");
        log.dispose();
        log.dispose();
        assert!(log.is_disposed());
        assert_eq!(log.state(), Err(FatalError::Disposed));
        assert_eq!(
            log.emit(vec![Op::set(Path::root(), "x", 1)]),
            Err(FatalError::Disposed)
        );
        assert_eq!(log.compact(), Err(FatalError::Disposed));
    }

    #[test]
    fn unsubscribed_callbacks_stop_firing() {
        let mut log = new_log("a");
        let calls = Rc::new(RefCell::new(0));
        let calls_in = Rc::clone(&calls);
        let id = log
            .subscribe(move |_, _| *calls_in.borrow_mut() += 1)
            .unwrap();
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
        assert_eq!(*calls.borrow(), 1);

        assert!(log.unsubscribe(id).unwrap());
        assert!(!log.unsubscribe(id).unwrap(), "second removal finds nothing");
        log.emit(vec![Op::set(Path::root(), "y", 2)]).unwrap();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn resync_recovers_from_unobserved_map_changes() {
        let mut log = new_log("a");
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();

        // A write lands in the shared map without any change delivery.
        log.doc.tx.0.insert(
            "0;9;z;0".to_owned(),
            TxRecord::new(vec![Op::set(Path::root(), "ghost", 9)]),
        );
        assert_eq!(log.state().unwrap(), Value::object_from([("x", 1)]));

        log.resync().unwrap();
        assert_eq!(
            log.state().unwrap(),
            Value::object_from([("x", 1), ("ghost", 9)])
        );
    }

    #[test]
    fn client_ids_with_semicolons_are_rejected() {
        let result = StateLog::<FakeDoc>::builder()
            .client_id("bad;id")
            .build(FakeDoc::default());
        let Err(err) = result else {
            panic!("expected build to reject a client id containing ';'");
        };
        assert!(matches!(err, FatalError::InvalidClientId(_)));
    }

    #[test]
    fn generated_client_ids_are_random_and_valid() {
        let log = StateLog::<FakeDoc>::builder().build(FakeDoc::default()).unwrap();
        assert_eq!(log.client_id().len(), 21);
        assert!(!log.client_id().contains(';'));
    }

    #[test]
    fn active_epoch_start_time_tracks_earliest_wall_clock() {
        let mut log = new_log("a");
        assert_eq!(log.active_epoch_start_time().unwrap(), None);
        log.emit(vec![Op::set(Path::root(), "x", 1)]).unwrap();
        let start = log.active_epoch_start_time().unwrap();
        assert!(start.is_some());
    }
}
