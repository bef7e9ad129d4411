// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Fatal error taxonomy for the state-log engine.
//!
//! Fatal errors abort the offending API call and propagate to the caller.
//! They indicate misuse (calling into a disposed log, an invalid client id)
//! or a corrupt shared log (malformed keys). Transaction rejections are NOT
//! errors in this taxonomy: a rejected transaction is silently dropped from
//! state derivation and surfaces nowhere (see [`crate::apply::ApplyError`]
//! for the internal rejection reasons).

use thiserror::Error;

/// Errors surfaced by the public engine API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// The state log was disposed; no further calls are accepted.
    #[error("state log has been disposed")]
    Disposed,

    /// A client id contained the reserved `';'` key delimiter.
    #[error("client id must not contain ';': {0:?}")]
    InvalidClientId(String),

    /// A transaction key did not parse as `epoch;clock;clientId;wallClock`.
    ///
    /// Keys are written bit-exactly by peers running this engine, so a
    /// malformed key means the shared map holds foreign or corrupt data.
    #[error("malformed transaction key: {0:?}")]
    MalformedTxKey(String),

    /// A checkpoint key did not parse as `epoch;txCount;clientId`.
    #[error("malformed checkpoint key: {0:?}")]
    MalformedCheckpointKey(String),

    /// Reconciliation would replace the document root with a value of a
    /// different kind (object vs array vs primitive).
    ///
    /// The operation algebra has no "replace root" form, so this cannot be
    /// expressed as a diff and is rejected up front.
    #[error("cannot reconcile a root replacement (kind change at the empty path)")]
    RootReplacement,
}
