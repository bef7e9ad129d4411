// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! wake-core: deterministic replicated JSON state-log engine.
//!
//! Peers share an operation log and a checkpoint map inside an external
//! last-writer-wins replicated document. Each peer independently derives
//! the same JSON state from the same log: transactions are Lamport-ordered
//! with a client-id tiebreak, applied through a copy-on-write draft with
//! structural sharing, deduplicated by logical identity, and periodically
//! compacted into epoch checkpoints with per-client watermarks and
//! retention-based pruning.
//!
//! The transport itself is out of scope: the engine consumes the document
//! through the narrow [`ReplicatedDoc`] interface and integrates its change
//! deliveries via [`StateLog::handle_changes`]. `wake-memdoc` provides the
//! in-memory reference collaborator used by the test suite.
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
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod apply;
mod calculator;
mod checkpoint;
mod controller;
mod doc;
mod draft;
mod error;
mod ident;
mod log_cache;
mod op;
mod reconcile;
mod record;
mod retention;
mod sync;
#[cfg(test)]
mod testsupport;
mod timestamp;
mod value;

// Re-exports for the stable public API.
/// Mutable applier and the transaction-rejection taxonomy.
pub use apply::{apply_ops_mut, ApplyError};
/// Incremental state derivation over the sorted log.
pub use calculator::{AppliedOps, CalcResult, InsertStatus, StateCalculator};
/// Epoch finalization and canonical-checkpoint selection.
pub use checkpoint::{finalized_epoch_and_canonical, prune_checkpoints, CheckpointView};
/// The peer-facing controller surface.
pub use controller::{StateLog, StateLogBuilder, Subscriber, SubscriptionId};
/// External collaborator interfaces (replicated document, clocks, changes).
pub use doc::{
    LogChanges, MapRead, MapWrite, OriginTag, ReplicatedDoc, SystemClock, TxKeyChanges, WallClock,
    DEFAULT_CHECKPOINT_MAP_NAME, DEFAULT_TX_MAP_NAME,
};
/// Copy-on-write draft context and the immutable applier.
pub use draft::{apply_txs_immutable, Draft, TxBatchOutcome, Validator};
/// Fatal error taxonomy.
pub use error::FatalError;
/// Client identity helpers.
pub use ident::{random_client_id, validate_client_id};
/// The five-variant operation algebra.
pub use op::{Op, OpKey};
/// Structural diffing into minimal op sequences.
pub use reconcile::reconcile_ops;
/// Stored record types for both shared maps.
pub use record::{CheckpointRecord, TxRecord, Watermark};
/// Retention policy for missed transactions and idle watermarks.
pub use retention::Retention;
/// Composite key codecs and ordering.
pub use timestamp::{CheckpointKey, TxTimestamp};
/// JSON value model and document paths.
pub use value::{ObjectMap, Path, PathSegment, Value, ValueKind};
